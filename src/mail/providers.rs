//! Known-provider presets
//!
//! The registry is built once (built-in table or a JSON override) and shared
//! read-only through an `Arc`.

use crate::mail::config::{DetectionMethod, ProviderSettings, SecurityType};
use crate::mail::DiscoveryResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One preset entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownProvider {
    pub name: String,
    /// Address domains served by this provider, matched as suffixes
    pub domains: Vec<String>,
    /// Domains of the provider's MX hosts, for hosted custom domains
    #[serde(default)]
    pub mx_domains: Vec<String>,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_security: SecurityType,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: SecurityType,
}

impl KnownProvider {
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            display_name: self.name.clone(),
            imap_host: self.imap_host.clone(),
            imap_port: self.imap_port,
            imap_security: self.imap_security,
            smtp_host: self.smtp_host.clone(),
            smtp_port: self.smtp_port,
            smtp_security: self.smtp_security,
            detection_method: DetectionMethod::Preset,
        }
    }

    fn serves(&self, domain: &str) -> bool {
        self.domains.iter().any(|suffix| matches_suffix(domain, suffix))
    }

    fn receives_for(&self, exchanger: &str) -> bool {
        self.mx_domains.iter().any(|suffix| matches_suffix(exchanger, suffix))
    }
}

/// `domain` equals `suffix` or ends with `.suffix`, ignoring case.
fn matches_suffix(domain: &str, suffix: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let suffix = suffix.trim().trim_end_matches('.').to_lowercase();
    if suffix.is_empty() {
        return false;
    }
    domain == suffix
        || domain
            .strip_suffix(&suffix)
            .map(|head| head.ends_with('.'))
            .unwrap_or(false)
}

/// Immutable table of known providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRegistry {
    providers: Vec<KnownProvider>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<KnownProvider>) -> Self {
        Self { providers }
    }

    /// Built-in presets
    pub fn builtin() -> Self {
        Self::new(builtin_providers())
    }

    /// An empty table; every lookup misses.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load a replacement table from JSON: either an array of providers or
    /// `{"providers": [...]}`.
    pub fn from_json(json: &str) -> DiscoveryResult<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Document {
            List(Vec<KnownProvider>),
            Table { providers: Vec<KnownProvider> },
        }

        let providers = match serde_json::from_str::<Document>(json)? {
            Document::List(providers) => providers,
            Document::Table { providers } => providers,
        };
        log::info!("Loaded {} provider presets from JSON", providers.len());
        Ok(Self::new(providers))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> DiscoveryResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Preset settings for an address domain.
    pub fn lookup(&self, domain: &str) -> Option<ProviderSettings> {
        self.providers
            .iter()
            .find(|p| p.serves(domain))
            .map(KnownProvider::settings)
    }

    /// Preset whose MX hosts include `exchanger`, for custom domains hosted
    /// by a known provider.
    pub fn lookup_by_exchanger(&self, exchanger: &str) -> Option<ProviderSettings> {
        self.providers
            .iter()
            .find(|p| p.receives_for(exchanger))
            .map(KnownProvider::settings)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&KnownProvider> {
        let name = name.trim();
        self.providers.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn providers(&self) -> &[KnownProvider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn preset(
    name: &str,
    domains: &[&str],
    mx_domains: &[&str],
    imap: (&str, u16, SecurityType),
    smtp: (&str, u16, SecurityType),
) -> KnownProvider {
    KnownProvider {
        name: name.to_string(),
        domains: domains.iter().map(|d| d.to_string()).collect(),
        mx_domains: mx_domains.iter().map(|d| d.to_string()).collect(),
        imap_host: imap.0.to_string(),
        imap_port: imap.1,
        imap_security: imap.2,
        smtp_host: smtp.0.to_string(),
        smtp_port: smtp.1,
        smtp_security: smtp.2,
    }
}

fn builtin_providers() -> Vec<KnownProvider> {
    use SecurityType::{SSL, STARTTLS};

    vec![
        // Gmail
        preset(
            "Google",
            &["gmail.com", "googlemail.com"],
            &["google.com", "googlemail.com"],
            ("imap.gmail.com", 993, SSL),
            ("smtp.gmail.com", 587, STARTTLS),
        ),
        // Outlook / Microsoft
        preset(
            "Microsoft",
            &["outlook.com", "hotmail.com", "live.com", "msn.com"],
            &["outlook.com"],
            ("outlook.office365.com", 993, SSL),
            ("smtp.office365.com", 587, STARTTLS),
        ),
        // Yahoo
        preset(
            "Yahoo",
            &["yahoo.com", "ymail.com", "rocketmail.com"],
            &["yahoodns.net"],
            ("imap.mail.yahoo.com", 993, SSL),
            ("smtp.mail.yahoo.com", 465, SSL),
        ),
        // iCloud
        preset(
            "Apple iCloud",
            &["icloud.com", "me.com", "mac.com"],
            &["icloud.com"],
            ("imap.mail.me.com", 993, SSL),
            ("smtp.mail.me.com", 587, STARTTLS),
        ),
        // Zoho
        preset(
            "Zoho Mail",
            &["zoho.com", "zohomail.com"],
            &["zoho.com", "zoho.eu"],
            ("imap.zoho.com", 993, SSL),
            ("smtp.zoho.com", 465, SSL),
        ),
        // Fastmail
        preset(
            "Fastmail",
            &["fastmail.com", "fastmail.fm"],
            &["messagingengine.com"],
            ("imap.fastmail.com", 993, SSL),
            ("smtp.fastmail.com", 465, SSL),
        ),
        // Yandex
        preset(
            "Yandex",
            &["yandex.com", "yandex.ru"],
            &["yandex.net", "yandex.ru"],
            ("imap.yandex.com", 993, SSL),
            ("smtp.yandex.com", 465, SSL),
        ),
    ]
}
