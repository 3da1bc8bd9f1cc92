//! # Owlivion Discovery
//!
//! IMAP/SMTP server auto-detection for email accounts.
//!
//! A [`Detector`] resolves an address or a bare domain to a complete
//! [`ProviderSettings`] record by trying, in order: the built-in provider
//! presets, Outlook Autodiscover, Mozilla/Apple/well-known autoconfig and a
//! DNS MX heuristic. All network access goes through injectable capabilities
//! ([`HttpTransport`], [`MxLookup`], [`ConnectProbe`]).
//!
//! ```no_run
//! use owlivion_discovery::{DiscoveryConfig, Detector};
//!
//! # async fn run() -> owlivion_discovery::DiscoveryResult<()> {
//! let detector = Detector::with_defaults(DiscoveryConfig::from_env()?)?;
//! if let Some(settings) = detector.detect("someone@example.com").await? {
//!     println!("IMAP {}:{}", settings.imap_host, settings.imap_port);
//! }
//! # Ok(())
//! # }
//! ```

pub mod mail;

pub use mail::{
    validate, validate_domain, validate_email, AutoconfigFlavor, AutoconfigProbe, ConnectProbe,
    DetectionMethod, DetectionReport, Detector, DetectorBuilder, DiscoveryConfig, DiscoveryError,
    DiscoveryQuery, DiscoveryResult, DiscoveryTier, DnsHeuristicResolver, HickoryMxLookup,
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, KnownProvider, MailExchangerRecord,
    MxLookup, OutlookAutodiscoverProbe, ProviderRegistry, ProviderSettings, ReqwestTransport,
    SecurityType, TierAttempt, TierKind, TierOutcome, TokioConnectProbe, ValidatedInput,
};
