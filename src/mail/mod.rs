//! # Owlivion Discovery - Mail Module
//!
//! Server discovery for IMAP/SMTP accounts: presets, autodiscover/autoconfig
//! protocols and a DNS fallback, sequenced by [`Detector`].

pub mod autoconfig;
pub mod autodiscover;
pub mod config;
pub mod detector;
pub mod dns;
pub mod providers;
pub mod tier;
pub mod transport;
pub mod validate;


// Re-export commonly used types
pub use autoconfig::{AutoconfigFlavor, AutoconfigProbe};
pub use autodiscover::OutlookAutodiscoverProbe;
pub use config::{DetectionMethod, DiscoveryConfig, ProviderSettings, SecurityType, TierKind};
pub use detector::{DetectionReport, Detector, DetectorBuilder, TierAttempt, TierOutcome};
pub use dns::{
    ConnectProbe, DnsHeuristicResolver, HickoryMxLookup, MailExchangerRecord, MxLookup,
    TokioConnectProbe,
};
pub use providers::{KnownProvider, ProviderRegistry};
pub use tier::{DiscoveryQuery, DiscoveryTier};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use validate::{validate, validate_domain, validate_email, ValidatedInput};

/// Result type alias for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Unified error type for discovery operations
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// True for failures scoped to a single candidate URL, host or query.
    ///
    /// Probes swallow these and move on; anything else is an unexpected
    /// fault that the detector logs before continuing with the next tier.
    pub fn is_candidate_failure(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Timeout(_)
                | DiscoveryError::Connect(_)
                | DiscoveryError::Status { .. }
                | DiscoveryError::Xml(_)
                | DiscoveryError::Dns(_)
        )
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DiscoveryError::Timeout(e.to_string())
        } else if e.is_connect() {
            DiscoveryError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            DiscoveryError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            DiscoveryError::Transport(e.to_string())
        }
    }
}

impl From<quick_xml::Error> for DiscoveryError {
    fn from(e: quick_xml::Error) -> Self {
        DiscoveryError::Xml(e.to_string())
    }
}

impl From<hickory_resolver::error::ResolveError> for DiscoveryError {
    fn from(e: hickory_resolver::error::ResolveError) -> Self {
        DiscoveryError::Dns(e.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Config(e.to_string())
    }
}
