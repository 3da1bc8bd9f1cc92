//! Common contract for the discovery strategies run after the preset lookup

use crate::mail::config::ProviderSettings;
use crate::mail::validate::address_domain;
use crate::mail::DiscoveryResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Input handed to every tier
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    /// Validated, lower-cased domain
    pub domain: String,
    /// Address to send to protocols that need one
    pub address: String,
    /// `address` is a placeholder made up for a domain-only probe
    pub synthesized_address: bool,
    /// Point in time after which no new network operation should start
    pub deadline: Instant,
}

impl DiscoveryQuery {
    pub fn for_address(domain: &str, address: &str, deadline: Instant) -> Self {
        Self {
            domain: domain.to_string(),
            address: address.to_string(),
            synthesized_address: false,
            deadline,
        }
    }

    /// Domain-only query; protocols that insist on an address get `test@<domain>`.
    pub fn for_domain(domain: &str, deadline: Instant) -> Self {
        Self {
            domain: domain.to_string(),
            address: format!("test@{}", address_domain(domain)),
            synthesized_address: true,
            deadline,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Per-operation timeout clipped to the remaining budget.
    pub fn clip(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// One discovery strategy
///
/// `Ok(None)` means the strategy has nothing for this domain. `Err` is kept
/// for unexpected faults; the detector logs it and continues with the next
/// tier either way.
#[async_trait]
pub trait DiscoveryTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn try_discover(&self, query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_domain_query_synthesizes_address() {
        let query = DiscoveryQuery::for_domain("example.com", Instant::now() + Duration::from_secs(5));
        assert_eq!(query.address, "test@example.com");
        assert!(query.synthesized_address);
    }

    #[tokio::test]
    async fn test_domain_query_brackets_ip_literals() {
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(
            DiscoveryQuery::for_domain("192.0.2.10", deadline).address,
            "test@[192.0.2.10]"
        );
        assert_eq!(
            DiscoveryQuery::for_domain("2001:db8::1", deadline).address,
            "test@[IPv6:2001:db8::1]"
        );
    }

    #[tokio::test]
    async fn test_clip_respects_deadline() {
        let query = DiscoveryQuery::for_address(
            "example.com",
            "user@example.com",
            Instant::now() + Duration::from_millis(200),
        );
        assert!(query.clip(Duration::from_secs(5)) <= Duration::from_millis(200));
        assert_eq!(query.clip(Duration::from_millis(10)), Duration::from_millis(10));

        let expired = DiscoveryQuery::for_domain("example.com", Instant::now());
        assert!(expired.is_expired());
        assert_eq!(expired.clip(Duration::from_secs(1)), Duration::ZERO);
    }
}
