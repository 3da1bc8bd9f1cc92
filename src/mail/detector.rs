//! Discovery orchestration
//!
//! Runs the preset lookup and then each configured tier in order until one
//! produces complete settings. Tier failures never abort the sequence.

use crate::mail::autoconfig::{AutoconfigFlavor, AutoconfigProbe};
use crate::mail::autodiscover::OutlookAutodiscoverProbe;
use crate::mail::config::{DiscoveryConfig, ProviderSettings, TierKind};
use crate::mail::dns::{ConnectProbe, DnsHeuristicResolver, HickoryMxLookup, MxLookup, TokioConnectProbe};
use crate::mail::providers::ProviderRegistry;
use crate::mail::tier::{DiscoveryQuery, DiscoveryTier};
use crate::mail::transport::{HttpTransport, ReqwestTransport};
use crate::mail::validate::{validate_domain, validate_email, ValidatedInput};
use crate::mail::{DiscoveryError, DiscoveryResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const REGISTRY_STEP: &str = "registry";

/// What happened when a tier was tried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TierOutcome {
    /// Produced the returned settings
    Hit,
    NoResult,
    /// Returned settings with a missing host or port
    Discarded,
    /// Unexpected fault, logged and skipped
    Error(String),
    /// Ran into the overall deadline
    TimedOut,
    /// Not run because the deadline had already passed
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierAttempt {
    pub tier: String,
    pub outcome: TierOutcome,
    pub duration_ms: u64,
}

/// Step-by-step account of one detection run
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub input: String,
    /// Validated domain, `None` when the input was rejected
    pub domain: Option<String>,
    pub steps: Vec<TierAttempt>,
    pub settings: Option<ProviderSettings>,
    pub total_duration_ms: u64,
}

impl DetectionReport {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
            domain: None,
            steps: Vec::new(),
            settings: None,
            total_duration_ms: 0,
        }
    }

    fn record(&mut self, tier: &str, outcome: TierOutcome, started: Instant) {
        self.steps.push(TierAttempt {
            tier: tier.to_string(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Name of the step that produced the settings
    pub fn winning_tier(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.outcome == TierOutcome::Hit)
            .map(|s| s.tier.as_str())
    }
}

/// Mail server auto-detection entry point
///
/// Holds only immutable state, so a single instance can serve concurrent
/// calls from many tasks.
pub struct Detector {
    registry: Arc<ProviderRegistry>,
    tiers: Vec<Box<dyn DiscoveryTier>>,
    config: DiscoveryConfig,
}

impl Detector {
    /// Assemble a detector from explicit parts.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        tiers: Vec<Box<dyn DiscoveryTier>>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            tiers,
            config,
        }
    }

    pub fn builder(config: DiscoveryConfig) -> DetectorBuilder {
        DetectorBuilder::new(config)
    }

    /// Built-in registry, reqwest, hickory and plain TCP connects.
    pub fn with_defaults(config: DiscoveryConfig) -> DiscoveryResult<Self> {
        DetectorBuilder::new(config).build()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Tier names in the order they run
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Detect settings for an email address.
    ///
    /// Invalid input and exhausted strategies both yield `Ok(None)`.
    pub async fn detect(&self, email: &str) -> DiscoveryResult<Option<ProviderSettings>> {
        Ok(self.detect_with_report(email).await.settings)
    }

    /// Detect settings for a bare domain.
    pub async fn probe(&self, domain: &str) -> DiscoveryResult<Option<ProviderSettings>> {
        Ok(self.probe_with_report(domain).await.settings)
    }

    pub async fn detect_with_cancel(
        &self,
        email: &str,
        token: &CancellationToken,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                log::info!("Detection for {} cancelled", email);
                Err(DiscoveryError::Cancelled)
            }
            result = self.detect(email) => result,
        }
    }

    pub async fn probe_with_cancel(
        &self,
        domain: &str,
        token: &CancellationToken,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                log::info!("Probe for {} cancelled", domain);
                Err(DiscoveryError::Cancelled)
            }
            result = self.probe(domain) => result,
        }
    }

    pub async fn detect_with_report(&self, email: &str) -> DetectionReport {
        let validated = validate_email(email);
        self.run(email, validated).await
    }

    pub async fn probe_with_report(&self, domain: &str) -> DetectionReport {
        let validated = validate_domain(domain).map(|domain| ValidatedInput {
            domain,
            address: None,
        });
        self.run(domain, validated).await
    }

    async fn run(&self, input: &str, validated: DiscoveryResult<ValidatedInput>) -> DetectionReport {
        let started = Instant::now();
        let mut report = DetectionReport::new(input);

        let validated = match validated {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Rejected discovery input: {}", e);
                return report;
            }
        };
        report.domain = Some(validated.domain.clone());

        let step_started = Instant::now();
        if let Some(settings) = self.registry.lookup(&validated.domain) {
            log::info!("Preset found for {}: {}", validated.domain, settings.display_name);
            report.record(REGISTRY_STEP, TierOutcome::Hit, step_started);
            report.settings = Some(settings);
            report.total_duration_ms = started.elapsed().as_millis() as u64;
            return report;
        }
        report.record(REGISTRY_STEP, TierOutcome::NoResult, step_started);

        let deadline = started + self.config.overall_timeout();
        let query = match &validated.address {
            Some(address) => DiscoveryQuery::for_address(&validated.domain, address, deadline),
            None => DiscoveryQuery::for_domain(&validated.domain, deadline),
        };

        for tier in &self.tiers {
            let step_started = Instant::now();
            if query.is_expired() {
                log::debug!("Skipping {} for {}: deadline reached", tier.name(), query.domain);
                report.record(tier.name(), TierOutcome::Skipped, step_started);
                continue;
            }

            let outcome = match tokio::time::timeout_at(deadline, tier.try_discover(&query)).await {
                Ok(Ok(Some(settings))) if settings.is_complete() => {
                    log::info!(
                        "{} found settings for {}: IMAP {}:{}, SMTP {}:{}",
                        tier.name(),
                        query.domain,
                        settings.imap_host,
                        settings.imap_port,
                        settings.smtp_host,
                        settings.smtp_port
                    );
                    report.settings = Some(settings);
                    TierOutcome::Hit
                }
                Ok(Ok(Some(_))) => {
                    log::warn!("{} returned incomplete settings for {}, ignoring", tier.name(), query.domain);
                    TierOutcome::Discarded
                }
                Ok(Ok(None)) => TierOutcome::NoResult,
                Ok(Err(e)) => {
                    log::warn!("{} failed for {}: {}", tier.name(), query.domain, e);
                    TierOutcome::Error(e.to_string())
                }
                Err(_elapsed) => {
                    log::debug!("{} ran out of time for {}", tier.name(), query.domain);
                    TierOutcome::TimedOut
                }
            };

            let hit = outcome == TierOutcome::Hit;
            report.record(tier.name(), outcome, step_started);
            if hit {
                break;
            }
        }

        if report.settings.is_none() {
            log::info!("No mail settings found for {}", validated.domain);
        }
        report.total_duration_ms = started.elapsed().as_millis() as u64;
        report
    }
}

/// Wires the default tiers from a [`DiscoveryConfig`], with optional
/// replacements for each network capability
pub struct DetectorBuilder {
    config: DiscoveryConfig,
    registry: Option<Arc<ProviderRegistry>>,
    http: Option<Arc<dyn HttpTransport>>,
    mx: Option<Arc<dyn MxLookup>>,
    connector: Option<Arc<dyn ConnectProbe>>,
}

impl DetectorBuilder {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            registry: None,
            http: None,
            mx: None,
            connector: None,
        }
    }

    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn mx_lookup(mut self, mx: Arc<dyn MxLookup>) -> Self {
        self.mx = Some(mx);
        self
    }

    pub fn connect_probe(mut self, connector: Arc<dyn ConnectProbe>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> DiscoveryResult<Detector> {
        let config = self.config;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProviderRegistry::builtin()));
        let http: Arc<dyn HttpTransport> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestTransport::new(&config.user_agent)?),
        };
        let mx: Arc<dyn MxLookup> = self
            .mx
            .unwrap_or_else(|| Arc::new(HickoryMxLookup::new(config.dns_timeout())));
        let connector: Arc<dyn ConnectProbe> = self
            .connector
            .unwrap_or_else(|| Arc::new(TokioConnectProbe));

        let mut tiers: Vec<Box<dyn DiscoveryTier>> = Vec::with_capacity(config.tiers.len());
        for kind in &config.tiers {
            let tier: Box<dyn DiscoveryTier> = match kind {
                TierKind::Outlook => Box::new(OutlookAutodiscoverProbe::new(http.clone(), &config)),
                TierKind::Mozilla => {
                    Box::new(AutoconfigProbe::new(AutoconfigFlavor::Mozilla, http.clone(), &config))
                }
                TierKind::Apple => {
                    Box::new(AutoconfigProbe::new(AutoconfigFlavor::Apple, http.clone(), &config))
                }
                TierKind::WellKnown => {
                    Box::new(AutoconfigProbe::new(AutoconfigFlavor::WellKnown, http.clone(), &config))
                }
                TierKind::Dns => Box::new(DnsHeuristicResolver::new(
                    mx.clone(),
                    connector.clone(),
                    registry.clone(),
                    &config,
                )),
            };
            tiers.push(tier);
        }

        log::debug!(
            "Detector ready with {} presets and tiers {:?}",
            registry.len(),
            config.tiers.iter().map(|t| t.as_str()).collect::<Vec<_>>()
        );

        Ok(Detector::new(registry, tiers, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedTier {
        name: &'static str,
        result: Option<ProviderSettings>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryTier for FixedTier {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn try_discover(&self, _query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FailingTier;

    #[async_trait]
    impl DiscoveryTier for FailingTier {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn try_discover(&self, _query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
            Err(DiscoveryError::Transport("socket exploded".to_string()))
        }
    }

    struct SlowTier;

    #[async_trait]
    impl DiscoveryTier for SlowTier {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn try_discover(&self, _query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    fn settings(host: &str) -> ProviderSettings {
        ProviderSettings {
            display_name: "Corp".to_string(),
            imap_host: format!("imap.{}", host),
            imap_port: 993,
            imap_security: crate::mail::SecurityType::SSL,
            smtp_host: format!("smtp.{}", host),
            smtp_port: 587,
            smtp_security: crate::mail::SecurityType::STARTTLS,
            detection_method: crate::mail::DetectionMethod::MozillaAutoconfig,
        }
    }

    fn fixed(name: &'static str, result: Option<ProviderSettings>) -> Box<dyn DiscoveryTier> {
        Box::new(FixedTier {
            name,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_incomplete_result_is_discarded() {
        let mut incomplete = settings("corp.test");
        incomplete.smtp_host = String::new();

        let detector = Detector::new(
            Arc::new(ProviderRegistry::empty()),
            vec![fixed("broken", Some(incomplete)), fixed("good", Some(settings("corp.test")))],
            DiscoveryConfig::default(),
        );

        let report = detector.detect_with_report("user@corp.test").await;
        let outcomes: Vec<_> = report.steps.iter().map(|s| s.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![TierOutcome::NoResult, TierOutcome::Discarded, TierOutcome::Hit]
        );
        assert_eq!(report.winning_tier(), Some("good"));
        assert_eq!(report.settings.unwrap().smtp_host, "smtp.corp.test");
    }

    #[tokio::test]
    async fn test_tier_error_does_not_abort() {
        let detector = Detector::new(
            Arc::new(ProviderRegistry::empty()),
            vec![Box::new(FailingTier), fixed("good", Some(settings("corp.test")))],
            DiscoveryConfig::default(),
        );

        let report = detector.detect_with_report("user@corp.test").await;
        assert!(matches!(report.steps[1].outcome, TierOutcome::Error(_)));
        assert_eq!(report.winning_tier(), Some("good"));
    }

    #[tokio::test]
    async fn test_overall_deadline_times_out_and_skips() {
        let config = DiscoveryConfig {
            overall_timeout_ms: 50,
            ..Default::default()
        };
        let detector = Detector::new(
            Arc::new(ProviderRegistry::empty()),
            vec![Box::new(SlowTier), fixed("late", Some(settings("corp.test")))],
            config,
        );

        let report = detector.probe_with_report("corp.test").await;
        assert_eq!(report.steps[1].outcome, TierOutcome::TimedOut);
        assert_eq!(report.steps[2].outcome, TierOutcome::Skipped);
        assert!(report.settings.is_none());
    }

    #[tokio::test]
    async fn test_rejected_input_has_no_steps() {
        let detector = Detector::new(
            Arc::new(ProviderRegistry::builtin()),
            vec![fixed("never", Some(settings("corp.test")))],
            DiscoveryConfig::default(),
        );

        let report = detector.detect_with_report("not an email").await;
        assert!(report.domain.is_none());
        assert!(report.steps.is_empty());
        assert!(report.settings.is_none());
    }

    #[tokio::test]
    async fn test_builder_follows_configured_tier_order() {
        let config = DiscoveryConfig {
            tiers: vec![TierKind::Dns, TierKind::Mozilla],
            ..Default::default()
        };
        let detector = Detector::with_defaults(config).unwrap();
        assert_eq!(detector.tier_names(), vec!["dns-heuristic", "mozilla-autoconfig"]);
    }

    #[test]
    fn test_report_serializes_outcomes() {
        let step = TierAttempt {
            tier: "failing".to_string(),
            outcome: TierOutcome::Error("boom".to_string()),
            duration_ms: 3,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["outcome"]["status"], "error");
        assert_eq!(json["outcome"]["detail"], "boom");
    }
}
