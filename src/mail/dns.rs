//! DNS-based fallback: MX lookup, hostname guessing and TCP verification
//!
//! The MX lookup and the TCP connect are injected so the heuristic can be
//! exercised without a network.

use crate::mail::config::{DetectionMethod, DiscoveryConfig, ProviderSettings, SecurityType};
use crate::mail::providers::ProviderRegistry;
use crate::mail::tier::{DiscoveryQuery, DiscoveryTier};
use crate::mail::validate::{is_ip_literal, validate_domain};
use crate::mail::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::system_conf;
use hickory_resolver::TokioAsyncResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

const IMAP_PORT: u16 = 993;
const SUBMISSION_PORT: u16 = 587;

/// Leading exchanger labels that name a mail host rather than the organization
const CONVENTIONAL_LABELS: &[&str] = &[
    "mail", "mx", "aspmx", "smtp", "in", "inbound", "mailin", "mx-in", "relay", "alt",
];

// ============================================================================
// Collaborators
// ============================================================================

/// MX lookup capability
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// Exchanger hostnames ordered by preference, best first.
    ///
    /// A domain without MX records yields an empty list, not an error.
    async fn lookup_mx(&self, domain: &str) -> DiscoveryResult<Vec<String>>;
}

/// TCP reachability check used to verify guessed hosts
#[async_trait]
pub trait ConnectProbe: Send + Sync {
    async fn can_connect(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// hickory-resolver backed MX lookup
pub struct HickoryMxLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryMxLookup {
    /// Resolver from the host's configuration (`/etc/resolv.conf` and
    /// friends), or the public defaults when that cannot be read.
    pub fn new(timeout: Duration) -> Self {
        let (config, opts) = resolver_setup(system_conf::read_system_conf(), timeout);
        Self::with_config(config, opts)
    }

    /// Resolver with an explicit upstream configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        log::debug!(
            "Initializing MX resolver with {} name server(s), timeout {:?}",
            config.name_servers().len(),
            opts.timeout
        );
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

fn resolver_setup<E: std::fmt::Display>(
    system: Result<(ResolverConfig, ResolverOpts), E>,
    timeout: Duration,
) -> (ResolverConfig, ResolverOpts) {
    let (config, mut opts) = match system {
        Ok((config, opts)) if !config.name_servers().is_empty() => (config, opts),
        Ok(_) => {
            log::warn!("System resolver configuration has no name servers, using defaults");
            (ResolverConfig::default(), ResolverOpts::default())
        }
        Err(e) => {
            log::warn!("Failed to read system resolver configuration, using defaults: {}", e);
            (ResolverConfig::default(), ResolverOpts::default())
        }
    };
    opts.timeout = timeout;
    opts.attempts = 2;
    (config, opts)
}

#[async_trait]
impl MxLookup for HickoryMxLookup {
    async fn lookup_mx(&self, domain: &str) -> DiscoveryResult<Vec<String>> {
        match self.resolver.mx_lookup(domain).await {
            Ok(response) => {
                let mut records: Vec<(u16, String)> = response
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_string()))
                    .collect();
                records.sort_by_key(|(preference, _)| *preference);
                Ok(records.into_iter().map(|(_, host)| host).collect())
            }
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                log::debug!("No MX records for {}", domain);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Plain `TcpStream::connect` with a timeout; no bytes are exchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioConnectProbe;

#[async_trait]
impl ConnectProbe for TokioConnectProbe {
    async fn can_connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                log::debug!("Connect to {}:{} failed: {}", host, port, e);
                false
            }
            Err(_elapsed) => {
                log::debug!("Connect to {}:{} timed out", host, port);
                false
            }
        }
    }
}

// ============================================================================
// Heuristic resolver
// ============================================================================

/// A resolved exchanger; `priority` is its rank, 0 being most preferred
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchangerRecord {
    pub hostname: String,
    pub priority: u16,
}

/// Guessed hosts for one protocol, in the order they are tried
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidates {
    imap: Vec<String>,
    smtp: Vec<String>,
}

pub struct DnsHeuristicResolver {
    mx: Arc<dyn MxLookup>,
    connector: Arc<dyn ConnectProbe>,
    registry: Arc<ProviderRegistry>,
    dns_timeout: Duration,
    connect_timeout: Duration,
    overall_timeout: Duration,
    verify: bool,
}

impl DnsHeuristicResolver {
    pub fn new(
        mx: Arc<dyn MxLookup>,
        connector: Arc<dyn ConnectProbe>,
        registry: Arc<ProviderRegistry>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            mx,
            connector,
            registry,
            dns_timeout: config.dns_timeout(),
            connect_timeout: config.connect_timeout(),
            overall_timeout: config.overall_timeout(),
            verify: config.verify_dns_candidates,
        }
    }

    /// Normalized MX records for `domain`, best first.
    pub async fn get_mail_exchangers(&self, domain: &str) -> DiscoveryResult<Vec<MailExchangerRecord>> {
        let deadline = Instant::now() + self.overall_timeout;
        self.mail_exchangers_before(domain, deadline).await
    }

    /// Full DNS fallback for `domain`.
    pub async fn discover_by_dns(&self, domain: &str) -> DiscoveryResult<Option<ProviderSettings>> {
        let deadline = Instant::now() + self.overall_timeout;
        self.discover_before(domain, deadline).await
    }

    /// Guess hosts from the exchangers and keep only the ones accepting TCP
    /// connections. Both an IMAP and an SMTP host must answer.
    pub async fn probe_discovered_servers(
        &self,
        domain: &str,
        mx_hostnames: &[String],
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        let deadline = Instant::now() + self.overall_timeout;
        let domain = validate_domain(domain)?;
        let base = mx_hostnames
            .first()
            .map(|mx| infer_base_domain(mx, &domain))
            .unwrap_or_else(|| domain.clone());
        self.verify_candidates(&base, &guess_candidates(&base), deadline)
            .await
    }

    async fn mail_exchangers_before(
        &self,
        domain: &str,
        deadline: Instant,
    ) -> DiscoveryResult<Vec<MailExchangerRecord>> {
        let domain = validate_domain(domain)?;
        if is_ip_literal(&domain) {
            return Ok(Vec::new());
        }

        let timeout = self.dns_timeout.min(deadline.saturating_duration_since(Instant::now()));
        let hosts = tokio::time::timeout(timeout, self.mx.lookup_mx(&domain))
            .await
            .map_err(|_| DiscoveryError::Timeout(format!("MX lookup for {}", domain)))??;

        let mut records = Vec::new();
        for host in hosts {
            let hostname = host.trim().trim_end_matches('.').to_lowercase();
            // Null MX (RFC 7505) or junk from the resolver
            if hostname.is_empty() || validate_domain(&hostname).is_err() {
                continue;
            }
            if records.iter().any(|r: &MailExchangerRecord| r.hostname == hostname) {
                continue;
            }
            let priority = records.len() as u16;
            records.push(MailExchangerRecord { hostname, priority });
        }

        log::debug!("{} MX record(s) for {}", records.len(), domain);
        Ok(records)
    }

    async fn discover_before(
        &self,
        domain: &str,
        deadline: Instant,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        let domain = validate_domain(domain)?;

        if is_ip_literal(&domain) {
            let candidates = Candidates {
                imap: vec![domain.clone()],
                smtp: vec![domain.clone()],
            };
            return self.select(&domain, &candidates, deadline).await;
        }

        let records = match self.mail_exchangers_before(&domain, deadline).await {
            Ok(records) => records,
            Err(e) if e.is_candidate_failure() => {
                log::debug!("MX lookup for {} failed: {}", domain, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(primary) = records.first() else {
            log::debug!("No usable MX records for {}", domain);
            return Ok(None);
        };

        if let Some(mut settings) = self.registry.lookup_by_exchanger(&primary.hostname) {
            log::info!(
                "MX {} for {} belongs to {}",
                primary.hostname,
                domain,
                settings.display_name
            );
            settings.detection_method = DetectionMethod::DnsHeuristic;
            return Ok(Some(settings));
        }

        let base = infer_base_domain(&primary.hostname, &domain);
        log::debug!("MX {} for {} suggests base domain {}", primary.hostname, domain, base);
        self.select(&base, &guess_candidates(&base), deadline).await
    }

    async fn select(
        &self,
        base: &str,
        candidates: &Candidates,
        deadline: Instant,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        if self.verify {
            return self.verify_candidates(base, candidates, deadline).await;
        }

        match (candidates.imap.first(), candidates.smtp.first()) {
            (Some(imap), Some(smtp)) => {
                log::info!("Using unverified guesses {} / {}", imap, smtp);
                Ok(Some(guessed_settings(base, imap, smtp)))
            }
            _ => Ok(None),
        }
    }

    async fn verify_candidates(
        &self,
        base: &str,
        candidates: &Candidates,
        deadline: Instant,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        let Some(imap) = self.first_listening(&candidates.imap, IMAP_PORT, deadline).await else {
            log::debug!("No IMAP candidate for {} accepted a connection", base);
            return Ok(None);
        };
        let Some(smtp) = self.first_listening(&candidates.smtp, SUBMISSION_PORT, deadline).await else {
            log::debug!("No SMTP candidate for {} accepted a connection", base);
            return Ok(None);
        };

        log::info!("Verified {}:{} and {}:{}", imap, IMAP_PORT, smtp, SUBMISSION_PORT);
        Ok(Some(guessed_settings(base, &imap, &smtp)))
    }

    async fn first_listening(&self, hosts: &[String], port: u16, deadline: Instant) -> Option<String> {
        for host in hosts {
            let timeout = self.connect_timeout.min(deadline.saturating_duration_since(Instant::now()));
            if timeout.is_zero() {
                log::debug!("Deadline reached before connecting to {}:{}", host, port);
                return None;
            }
            let connected = tokio::time::timeout(timeout, self.connector.can_connect(host, port, timeout))
                .await
                .unwrap_or(false);
            if connected {
                return Some(host.clone());
            }
        }
        None
    }
}

#[async_trait]
impl DiscoveryTier for DnsHeuristicResolver {
    fn name(&self) -> &'static str {
        "dns-heuristic"
    }

    async fn try_discover(&self, query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
        self.discover_before(&query.domain, query.deadline).await
    }
}

fn is_conventional_label(label: &str) -> bool {
    if label.len() == 1 || CONVENTIONAL_LABELS.contains(&label) {
        return true;
    }
    // mx1, mx02, mail2, alt4, smtp-in ...
    CONVENTIONAL_LABELS.iter().any(|prefix| {
        label
            .strip_prefix(prefix)
            .map(|rest| {
                let rest = rest.trim_start_matches('-');
                !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
            })
            .unwrap_or(false)
    })
}

/// Strip host-style leading labels from an exchanger name to get the
/// organization's mail domain, falling back to `domain`.
fn infer_base_domain(exchanger: &str, domain: &str) -> String {
    let exchanger = exchanger.trim().trim_end_matches('.').to_lowercase();
    let mut labels: Vec<&str> = exchanger.split('.').collect();

    while labels.len() > 2 && is_conventional_label(labels[0]) {
        labels.remove(0);
    }

    let base = labels.join(".");
    match validate_domain(&base) {
        Ok(base) if !is_ip_literal(&base) => base,
        _ => domain.to_string(),
    }
}

fn guess_candidates(base: &str) -> Candidates {
    Candidates {
        imap: vec![format!("imap.{}", base), format!("mail.{}", base)],
        smtp: vec![format!("smtp.{}", base), format!("mail.{}", base)],
    }
}

fn guessed_settings(base: &str, imap: &str, smtp: &str) -> ProviderSettings {
    ProviderSettings {
        display_name: base.to_string(),
        imap_host: imap.to_string(),
        imap_port: IMAP_PORT,
        imap_security: SecurityType::SSL,
        smtp_host: smtp.to_string(),
        smtp_port: SUBMISSION_PORT,
        smtp_security: SecurityType::STARTTLS,
        detection_method: DetectionMethod::DnsHeuristic,
    }
}
