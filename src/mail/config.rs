//! Discovery Configuration Module

use crate::mail::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Security type for email connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    SSL,
    STARTTLS,
    NONE,
}

impl SecurityType {
    pub fn default_imap_port(&self) -> u16 {
        match self {
            SecurityType::SSL => 993,
            SecurityType::STARTTLS => 143,
            SecurityType::NONE => 143,
        }
    }

    pub fn default_smtp_port(&self) -> u16 {
        match self {
            SecurityType::SSL => 465,
            SecurityType::STARTTLS => 587,
            SecurityType::NONE => 25,
        }
    }

    /// Map an ISPDB `socketType` value.
    pub fn from_socket_type(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "SSL" | "TLS" => SecurityType::SSL,
            "STARTTLS" => SecurityType::STARTTLS,
            _ => SecurityType::NONE,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SecurityType::NONE)
    }
}

/// Which tier produced a settings record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Preset,
    OutlookAutodiscover,
    MozillaAutoconfig,
    AppleAutoconfig,
    WellKnownAutoconfig,
    DnsHeuristic,
}

/// Resolved IMAP/SMTP settings for a mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub display_name: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_security: SecurityType,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: SecurityType,
    pub detection_method: DetectionMethod,
}

impl ProviderSettings {
    /// Whether both servers require transport security (SSL/TLS or STARTTLS).
    pub fn use_ssl(&self) -> bool {
        self.imap_security.is_encrypted() && self.smtp_security.is_encrypted()
    }

    /// Non-empty hosts and non-zero ports for both servers.
    pub fn is_complete(&self) -> bool {
        !self.imap_host.trim().is_empty()
            && !self.smtp_host.trim().is_empty()
            && self.imap_port > 0
            && self.smtp_port > 0
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.imap_host.trim().is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.imap_port == 0 {
            errors.push("IMAP port must be positive".to_string());
        }
        if self.smtp_host.trim().is_empty() {
            errors.push("SMTP host is required".to_string());
        }
        if self.smtp_port == 0 {
            errors.push("SMTP port must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A discovery strategy that can be placed in the detector's tier list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    Outlook,
    Mozilla,
    Apple,
    WellKnown,
    Dns,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Outlook => "outlook",
            TierKind::Mozilla => "mozilla",
            TierKind::Apple => "apple",
            TierKind::WellKnown => "well-known",
            TierKind::Dns => "dns",
        }
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "outlook" => Ok(TierKind::Outlook),
            "mozilla" => Ok(TierKind::Mozilla),
            "apple" => Ok(TierKind::Apple),
            "well-known" | "wellknown" => Ok(TierKind::WellKnown),
            "dns" => Ok(TierKind::Dns),
            _ => Err(format!("Invalid discovery tier: {}", s)),
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Timeout for a single HTTP candidate request
    pub request_timeout_ms: u64,
    /// Timeout for a single MX query
    pub dns_timeout_ms: u64,
    /// Timeout for a single TCP connect verification
    pub connect_timeout_ms: u64,
    /// Upper bound for a whole detect/probe call
    pub overall_timeout_ms: u64,
    /// Confirm DNS-guessed hosts with a TCP connect before returning them
    pub verify_dns_candidates: bool,
    /// Maximum autodiscover redirects followed per candidate
    pub max_redirects: usize,
    pub user_agent: String,
    /// Tier order after the preset lookup
    pub tiers: Vec<TierKind>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            dns_timeout_ms: 3_000,
            connect_timeout_ms: 2_000,
            overall_timeout_ms: 30_000,
            verify_dns_candidates: true,
            max_redirects: 10,
            user_agent: format!("owlivion-discovery/{}", env!("CARGO_PKG_VERSION")),
            tiers: vec![
                TierKind::Outlook,
                TierKind::Mozilla,
                TierKind::Apple,
                TierKind::WellKnown,
                TierKind::Dns,
            ],
        }
    }
}

impl DiscoveryConfig {
    /// Defaults overridden by `OWLIVION_DISCOVERY_*` environment variables.
    ///
    /// A `.env` file is honoured when present.
    pub fn from_env() -> DiscoveryResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> DiscoveryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let millis = |key: &str, current: u64| -> DiscoveryResult<u64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| DiscoveryError::Config(format!("{} must be an integer: {}", key, v))),
                None => Ok(current),
            }
        };

        config.request_timeout_ms =
            millis("OWLIVION_DISCOVERY_REQUEST_TIMEOUT_MS", config.request_timeout_ms)?;
        config.dns_timeout_ms = millis("OWLIVION_DISCOVERY_DNS_TIMEOUT_MS", config.dns_timeout_ms)?;
        config.connect_timeout_ms =
            millis("OWLIVION_DISCOVERY_CONNECT_TIMEOUT_MS", config.connect_timeout_ms)?;
        config.overall_timeout_ms =
            millis("OWLIVION_DISCOVERY_OVERALL_TIMEOUT_MS", config.overall_timeout_ms)?;

        if let Some(v) = lookup("OWLIVION_DISCOVERY_VERIFY_DNS") {
            config.verify_dns_candidates = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(DiscoveryError::Config(format!(
                        "OWLIVION_DISCOVERY_VERIFY_DNS must be a boolean: {}",
                        other
                    )))
                }
            };
        }

        if let Some(v) = lookup("OWLIVION_DISCOVERY_TIERS") {
            config.tiers = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(TierKind::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(DiscoveryError::Config)?;
        }

        if let Some(v) = lookup("OWLIVION_DISCOVERY_USER_AGENT") {
            config.user_agent = v;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(imap_host: &str, smtp_port: u16) -> ProviderSettings {
        ProviderSettings {
            display_name: "Example".to_string(),
            imap_host: imap_host.to_string(),
            imap_port: 993,
            imap_security: SecurityType::SSL,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port,
            smtp_security: SecurityType::STARTTLS,
            detection_method: DetectionMethod::Preset,
        }
    }

    #[test]
    fn test_socket_type_mapping() {
        assert_eq!(SecurityType::from_socket_type("SSL"), SecurityType::SSL);
        assert_eq!(SecurityType::from_socket_type("tls"), SecurityType::SSL);
        assert_eq!(SecurityType::from_socket_type("STARTTLS"), SecurityType::STARTTLS);
        assert_eq!(SecurityType::from_socket_type("plain"), SecurityType::NONE);
    }

    #[test]
    fn test_completeness() {
        assert!(settings("imap.example.com", 587).is_complete());
        assert!(!settings("", 587).is_complete());
        assert!(!settings("imap.example.com", 0).is_complete());

        let errors = settings(" ", 0).validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_use_ssl_requires_both_servers() {
        let mut s = settings("imap.example.com", 587);
        assert!(s.use_ssl());
        s.smtp_security = SecurityType::NONE;
        assert!(!s.use_ssl());
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("OWLIVION_DISCOVERY_REQUEST_TIMEOUT_MS", "1500"),
            ("OWLIVION_DISCOVERY_VERIFY_DNS", "off"),
            ("OWLIVION_DISCOVERY_TIERS", "mozilla, dns"),
        ]
        .into_iter()
        .collect();

        let config =
            DiscoveryConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert!(!config.verify_dns_candidates);
        assert_eq!(config.tiers, vec![TierKind::Mozilla, TierKind::Dns]);
        assert_eq!(config.dns_timeout_ms, 3_000);
    }

    #[test]
    fn test_config_rejects_unknown_tier() {
        let result = DiscoveryConfig::from_lookup(|k| {
            (k == "OWLIVION_DISCOVERY_TIERS").then(|| "outlook,carrier-pigeon".to_string())
        });
        assert!(matches!(result, Err(DiscoveryError::Config(_))));
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"tiers": ["well-known", "dns"], "max_redirects": 2}"#).unwrap();
        assert_eq!(config.tiers, vec![TierKind::WellKnown, TierKind::Dns]);
        assert_eq!(config.max_redirects, 2);
        assert!(config.verify_dns_candidates);
    }
}
