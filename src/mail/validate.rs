//! Input validation for discovery requests
//!
//! Every URL, XML body and DNS query built downstream is derived from the
//! validated value, so suspicious input is rejected, never cleaned up.

use crate::mail::{DiscoveryError, DiscoveryResult};
use regex_lite::Regex;
use std::net::{IpAddr, Ipv4Addr};

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LOCAL_PART_LEN: usize = 64;

/// Characters never accepted anywhere in an address or domain
const FORBIDDEN_CHARS: &[char] = &[';', '|', '`', '$', '<', '>', '"', '\'', '\\'];

/// A validated discovery request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    /// Lower-cased domain (or IP literal without brackets)
    pub domain: String,
    /// Full address when the input was an email address
    pub address: Option<String>,
}

lazy_static::lazy_static! {
    /// One DNS label: letters, digits and inner hyphens, at most 63 chars
    static ref LABEL_PATTERN: Option<Regex> =
        Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").ok();
}

fn is_valid_label(label: &str) -> bool {
    if let Some(re) = LABEL_PATTERN.as_ref() {
        return re.is_match(label);
    }
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Validate either an email address or a bare domain.
pub fn validate(raw: &str) -> DiscoveryResult<ValidatedInput> {
    if raw.contains('@') {
        validate_email(raw)
    } else {
        validate_domain(raw).map(|domain| ValidatedInput {
            domain,
            address: None,
        })
    }
}

/// Validate an email address and extract its domain.
pub fn validate_email(raw: &str) -> DiscoveryResult<ValidatedInput> {
    let email = raw.trim();
    check_characters(email)?;

    let mut parts = email.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => return Err(invalid("address must contain exactly one '@'")),
    };

    if local.is_empty() {
        return Err(invalid("local part is empty"));
    }
    if local.len() > MAX_LOCAL_PART_LEN {
        return Err(invalid("local part is too long"));
    }

    let domain = validate_domain(domain)?;
    let address = format!("{}@{}", local, address_domain(&domain));

    Ok(ValidatedInput {
        domain,
        address: Some(address),
    })
}

/// Validate a bare domain or IP literal, returning it lower-cased.
pub fn validate_domain(raw: &str) -> DiscoveryResult<String> {
    let domain = raw.trim();
    check_characters(domain)?;

    if let Some(ip) = parse_ip_literal(domain) {
        return Ok(ip.to_string());
    }

    let domain = domain.trim_end_matches('.').to_lowercase();

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("domain is too long"));
    }
    if !domain.contains('.') {
        return Err(invalid("domain must contain a '.'"));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.iter().any(|label| !is_valid_label(label)) {
        return Err(invalid("domain contains an invalid label"));
    }

    // Something like 999.1.1.1 or 10.20 that failed the IP parse above.
    let tld = labels.last().copied().unwrap_or_default();
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("numeric domain is not a valid IP address"));
    }

    Ok(domain)
}

fn check_characters(value: &str) -> DiscoveryResult<()> {
    if value.is_empty() {
        return Err(invalid("input is empty"));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN_CHARS.contains(&c))
    {
        return Err(invalid("input contains forbidden characters"));
    }
    Ok(())
}

/// Accepts `1.2.3.4`, `::1`, `[1.2.3.4]` and `[IPv6:2001:db8::1]`.
fn parse_ip_literal(value: &str) -> Option<IpAddr> {
    let inner = match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(bracketed) => bracketed
            .strip_prefix("IPv6:")
            .or_else(|| bracketed.strip_prefix("ipv6:"))
            .unwrap_or(bracketed),
        None => value,
    };

    if inner.contains(':') {
        return inner.parse::<IpAddr>().ok();
    }
    if inner.split('.').count() == 4 {
        return inner.parse::<Ipv4Addr>().ok().map(IpAddr::V4);
    }
    None
}

/// Domain part of an address; IP literals get their bracketed form.
pub(crate) fn address_domain(domain: &str) -> String {
    match domain.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("[{}]", ip),
        Ok(IpAddr::V6(ip)) => format!("[IPv6:{}]", ip),
        Err(_) => domain.to_string(),
    }
}

/// True when the domain is an IP literal rather than a DNS name.
pub(crate) fn is_ip_literal(domain: &str) -> bool {
    domain.parse::<IpAddr>().is_ok()
}

fn invalid(reason: &str) -> DiscoveryError {
    DiscoveryError::InvalidInput(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_email() {
        let input = validate_email("  User.Name+tag@Example.COM ").unwrap();
        assert_eq!(input.domain, "example.com");
        assert_eq!(input.address.as_deref(), Some("User.Name+tag@example.com"));
    }

    #[test]
    fn test_valid_domains() {
        assert_eq!(validate_domain("Mail.Example.org").unwrap(), "mail.example.org");
        assert_eq!(validate_domain("example.org.").unwrap(), "example.org");
        assert_eq!(validate_domain("xn--bcher-kva.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_ip_literals_accepted() {
        assert_eq!(validate_domain("192.168.1.10").unwrap(), "192.168.1.10");
        assert_eq!(validate_domain("[10.0.0.1]").unwrap(), "10.0.0.1");
        assert_eq!(validate_domain("2001:db8::1").unwrap(), "2001:db8::1");

        let input = validate_email("ops@[IPv6:2001:db8::1]").unwrap();
        assert_eq!(input.domain, "2001:db8::1");
        assert_eq!(input.address.as_deref(), Some("ops@[IPv6:2001:db8::1]"));
    }

    #[test]
    fn test_numeric_non_ip_rejected() {
        assert!(validate_domain("999.1.1.1").is_err());
        assert!(validate_domain("10.20").is_err());
        assert!(validate_domain("123.456").is_err());
    }

    #[test]
    fn test_malformed_rejected() {
        for raw in [
            "",
            "   ",
            "@example.com",
            "user@",
            "user@@example.com",
            "a@b@example.com",
            "user@localhost",
            "user@-bad.com",
            "user@bad-.com",
            "user@exa_mple.com",
            "user@example..com",
            "user name@example.com",
        ] {
            assert!(validate(raw).is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_label_rule() {
        assert!(LABEL_PATTERN.is_some());
        assert!(is_valid_label("xn--bcher-kva"));
        assert!(is_valid_label("a"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("-lead"));
        assert!(!is_valid_label("trail-"));
        assert!(!is_valid_label("under_score"));
        assert!(!is_valid_label(&"a".repeat(64)));
    }

    #[test]
    fn test_address_requires_at_sign() {
        assert!(validate_email("userexample.com").is_err());

        let bare = validate("userexample.com").unwrap();
        assert_eq!(bare.domain, "userexample.com");
        assert!(bare.address.is_none());
    }

    #[test]
    fn test_ipv6_tag_only_inside_brackets() {
        assert!(validate_domain("IPv6:::1").is_err());
        assert!(validate_domain("ipv6:2001:db8::1").is_err());
        assert_eq!(validate_domain("[IPv6:::1]").unwrap(), "::1");
    }

    #[test]
    fn test_address_domain_brackets_ip_literals() {
        assert_eq!(address_domain("example.com"), "example.com");
        assert_eq!(address_domain("192.0.2.10"), "[192.0.2.10]");
        assert_eq!(address_domain("2001:db8::1"), "[IPv6:2001:db8::1]");
    }

    #[test]
    fn test_injection_payloads_rejected() {
        for raw in [
            "user@example.com; rm -rf /",
            "user@example.com|cat /etc/passwd",
            "user@`whoami`.example.com",
            "user@$(reboot).example.com",
            "<script>alert(1)</script>@example.com",
            "user@example.com<script>",
            "admin'--@example.com",
            "user@example.com' OR '1'='1",
            "\"user\"@example.com",
            "user@example.com\r\nHost: evil",
            "example.com;drop table accounts",
        ] {
            assert!(validate(raw).is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_local_part_length() {
        let local = "a".repeat(65);
        assert!(validate_email(&format!("{}@example.com", local)).is_err());
    }
}
