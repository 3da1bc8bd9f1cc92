//! Outlook / Exchange POX Autodiscover
//!
//! POSTs the address to the autodiscover endpoints and reads the `IMAP` and
//! `SMTP` protocol blocks from the response. `redirectUrl` and `redirectAddr`
//! actions are followed up to the configured hop limit.

use crate::mail::autoconfig::url_host;
use crate::mail::config::{DetectionMethod, DiscoveryConfig, ProviderSettings, SecurityType};
use crate::mail::tier::{DiscoveryQuery, DiscoveryTier};
use crate::mail::transport::{fetch_body, HttpRequest, HttpTransport};
use crate::mail::validate::{is_ip_literal, validate_email};
use crate::mail::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use std::time::Duration;

const OUTLOOK_FALLBACK_URL: &str = "https://autodiscover-s.outlook.com/autodiscover/autodiscover.xml";
const RESPONSE_SCHEMA: &str =
    "http://schemas.microsoft.com/exchange/autodiscover/outlook/responseschema/2006a";

/// Outlook-style autodiscover probe
pub struct OutlookAutodiscoverProbe {
    http: Arc<dyn HttpTransport>,
    request_timeout: Duration,
    max_redirects: usize,
}

impl OutlookAutodiscoverProbe {
    pub fn new(http: Arc<dyn HttpTransport>, config: &DiscoveryConfig) -> Self {
        Self {
            http,
            request_timeout: config.request_timeout(),
            max_redirects: config.max_redirects,
        }
    }

    /// Candidate endpoints in the order they are tried.
    pub fn candidate_urls(domain: &str) -> Vec<String> {
        let mut urls = Vec::new();
        if !is_ip_literal(domain) {
            urls.push(format!(
                "https://autodiscover.{}/autodiscover/autodiscover.xml",
                domain
            ));
        }
        urls.push(format!(
            "https://{}/autodiscover/autodiscover.xml",
            url_host(domain)
        ));
        urls.push(OUTLOOK_FALLBACK_URL.to_string());
        urls
    }

    /// Follow one candidate through its redirects.
    async fn try_candidate(
        &self,
        query: &DiscoveryQuery,
        candidate: &str,
    ) -> DiscoveryResult<Option<ProviderSettings>> {
        let mut url = candidate.to_string();
        let mut address = query.address.clone();
        let mut hops = 0;

        loop {
            if query.is_expired() {
                return Err(DiscoveryError::Timeout(format!("deadline reached before {}", url)));
            }

            let request = HttpRequest::post(
                &url,
                request_body(&address),
                "text/xml",
                query.clip(self.request_timeout),
            );
            let xml = fetch_body(self.http.as_ref(), request).await?;
            let response = parse_autodiscover_xml(&xml)?;

            let action = response.action.clone();
            match action.as_deref() {
                Some("redirectUrl") => {
                    let target = response
                        .redirect_url
                        .ok_or_else(|| DiscoveryError::Xml("redirectUrl without target".to_string()))?;
                    check_redirect_url(&target)?;
                    log::debug!("outlook-autodiscover: {} redirects to {}", url, target);
                    url = target;
                }
                Some("redirectAddr") => {
                    let target = response
                        .redirect_addr
                        .ok_or_else(|| DiscoveryError::Xml("redirectAddr without target".to_string()))?;
                    let validated = validate_email(&target)?;
                    log::debug!("outlook-autodiscover: address redirected at {}", url);
                    address = validated.address.unwrap_or(target);
                }
                _ => return Ok(response.into_settings(&query.domain)),
            }

            hops += 1;
            if hops > self.max_redirects {
                return Err(DiscoveryError::Xml(format!(
                    "more than {} redirects from {}",
                    self.max_redirects, candidate
                )));
            }
        }
    }
}

#[async_trait]
impl DiscoveryTier for OutlookAutodiscoverProbe {
    fn name(&self) -> &'static str {
        "outlook-autodiscover"
    }

    async fn try_discover(&self, query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
        let mut fault = None;

        for url in Self::candidate_urls(&query.domain) {
            if query.is_expired() {
                log::debug!("{}: deadline reached before {}", self.name(), url);
                break;
            }

            log::debug!("{}: trying {}", self.name(), url);
            match self.try_candidate(query, &url).await {
                Ok(Some(settings)) => {
                    log::info!("{}: found configuration at {}", self.name(), url);
                    return Ok(Some(settings));
                }
                Ok(None) => log::debug!("{}: no IMAP/SMTP settings at {}", self.name(), url),
                Err(e) if e.is_candidate_failure() || matches!(e, DiscoveryError::InvalidInput(_)) => {
                    log::debug!("{}: candidate {} failed: {}", self.name(), url, e);
                }
                Err(e) => {
                    log::debug!("{}: transport fault at {}: {}", self.name(), url, e);
                    fault = Some(e);
                }
            }
        }

        match fault {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Autodiscover request document
fn request_body(address: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Autodiscover xmlns="http://schemas.microsoft.com/exchange/autodiscover/outlook/requestschema/2006">
  <Request>
    <EMailAddress>{}</EMailAddress>
    <AcceptableResponseSchema>{}</AcceptableResponseSchema>
  </Request>
</Autodiscover>"#,
        quick_xml::escape::escape(address),
        RESPONSE_SCHEMA
    )
}

/// Redirect targets must be absolute HTTPS URLs.
fn check_redirect_url(target: &str) -> DiscoveryResult<()> {
    let parsed = url::Url::parse(target)
        .map_err(|e| DiscoveryError::Xml(format!("invalid redirect URL {}: {}", target, e)))?;
    if parsed.scheme() != "https" || parsed.host_str().is_none() {
        return Err(DiscoveryError::Xml(format!(
            "refusing non-HTTPS redirect to {}",
            target
        )));
    }
    Ok(())
}

// ============================================================================
// Response schema
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct OutlookProtocol {
    protocol_type: String,
    server: Option<String>,
    port: Option<u16>,
    ssl: Option<String>,
    encryption: Option<String>,
}

impl OutlookProtocol {
    fn security(&self) -> SecurityType {
        match self.encryption.as_deref().map(str::to_lowercase).as_deref() {
            Some("ssl") => return SecurityType::SSL,
            Some("tls") => return SecurityType::STARTTLS,
            Some("none") => return SecurityType::NONE,
            _ => {}
        }
        match self.ssl.as_deref().map(str::to_lowercase).as_deref() {
            Some("off") => SecurityType::NONE,
            _ => SecurityType::SSL,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct OutlookResponse {
    display_name: Option<String>,
    action: Option<String>,
    redirect_url: Option<String>,
    redirect_addr: Option<String>,
    error_code: Option<String>,
    protocols: Vec<OutlookProtocol>,
}

impl OutlookResponse {
    fn protocol(&self, protocol_type: &str) -> Option<&OutlookProtocol> {
        self.protocols.iter().find(|p| {
            p.protocol_type.eq_ignore_ascii_case(protocol_type)
                && p.server.as_deref().is_some_and(|s| !s.is_empty())
        })
    }

    /// Settings when both an IMAP and an SMTP block are present.
    fn into_settings(self, domain: &str) -> Option<ProviderSettings> {
        if let Some(code) = &self.error_code {
            log::debug!("outlook-autodiscover: server returned error {}", code);
        }

        let imap = self.protocol("IMAP")?;
        let smtp = self.protocol("SMTP")?;
        let imap_security = imap.security();
        let smtp_security = smtp.security();

        Some(ProviderSettings {
            display_name: self.display_name.clone().unwrap_or_else(|| domain.to_string()),
            imap_host: imap.server.clone().unwrap_or_default(),
            imap_port: imap.port.unwrap_or_else(|| imap_security.default_imap_port()),
            imap_security,
            smtp_host: smtp.server.clone().unwrap_or_default(),
            smtp_port: smtp.port.unwrap_or_else(|| smtp_security.default_smtp_port()),
            smtp_security,
            detection_method: DetectionMethod::OutlookAutodiscover,
        })
    }
}

/// Parse an autodiscover response document
fn parse_autodiscover_xml(xml: &str) -> DiscoveryResult<OutlookResponse> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut response = OutlookResponse::default();
    let mut saw_root = false;
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<OutlookProtocol> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "Autodiscover" {
                    saw_root = true;
                }
                if name == "Protocol" {
                    current = Some(OutlookProtocol::default());
                }
                path.push(name);
            }
            Event::Text(e) => {
                let text = e.unescape()?.trim().to_string();
                let element = path.last().map(String::as_str).unwrap_or_default();
                let parent = path
                    .len()
                    .checked_sub(2)
                    .map(|i| path[i].as_str())
                    .unwrap_or_default();

                if let Some(protocol) = current.as_mut() {
                    if parent == "Protocol" {
                        match element {
                            "Type" => protocol.protocol_type = text,
                            "Server" => protocol.server = Some(text),
                            "Port" => protocol.port = text.parse::<u16>().ok().filter(|p| *p > 0),
                            "SSL" => protocol.ssl = Some(text),
                            "Encryption" => protocol.encryption = Some(text),
                            _ => {}
                        }
                    }
                } else {
                    match (parent, element) {
                        ("User", "DisplayName") => response.display_name = Some(text),
                        ("Account", "Action") => response.action = Some(text),
                        ("Account", "RedirectUrl") => response.redirect_url = Some(text),
                        ("Account", "RedirectAddr") => response.redirect_addr = Some(text),
                        ("Error", "ErrorCode") => response.error_code = Some(text),
                        _ => {}
                    }
                }
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("Protocol") {
                    if let Some(protocol) = current.take() {
                        response.protocols.push(protocol);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(DiscoveryError::Xml("missing Autodiscover element".to_string()));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Autodiscover xmlns="http://schemas.microsoft.com/exchange/autodiscover/responseschema/2006">
  <Response xmlns="http://schemas.microsoft.com/exchange/autodiscover/outlook/responseschema/2006a">
    <User><DisplayName>Example Corp</DisplayName></User>
    <Account>
      <AccountType>email</AccountType>
      <Action>settings</Action>
      <Protocol>
        <Type>IMAP</Type>
        <Server>imap.example.com</Server>
        <Port>993</Port>
        <SSL>on</SSL>
      </Protocol>
      <Protocol>
        <Type>SMTP</Type>
        <Server>smtp.example.com</Server>
        <Port>587</Port>
        <SSL>on</SSL>
        <Encryption>TLS</Encryption>
      </Protocol>
    </Account>
  </Response>
</Autodiscover>"#;

    #[test]
    fn test_parse_settings_response() {
        let response = parse_autodiscover_xml(SETTINGS_XML).unwrap();
        assert_eq!(response.protocols.len(), 2);
        assert_eq!(response.action.as_deref(), Some("settings"));

        let settings = response.into_settings("example.com").unwrap();
        assert_eq!(settings.display_name, "Example Corp");
        assert_eq!(settings.imap_host, "imap.example.com");
        assert_eq!(settings.imap_port, 993);
        assert_eq!(settings.imap_security, SecurityType::SSL);
        assert_eq!(settings.smtp_host, "smtp.example.com");
        assert_eq!(settings.smtp_port, 587);
        assert_eq!(settings.smtp_security, SecurityType::STARTTLS);
        assert!(settings.use_ssl());
    }

    #[test]
    fn test_missing_smtp_block_yields_nothing() {
        let xml = r#"<Autodiscover><Response><Account><Action>settings</Action>
            <Protocol><Type>IMAP</Type><Server>imap.example.com</Server><Port>993</Port></Protocol>
            <Protocol><Type>EXCH</Type><Server>ex.example.com</Server></Protocol>
        </Account></Response></Autodiscover>"#;

        let response = parse_autodiscover_xml(xml).unwrap();
        assert!(response.into_settings("example.com").is_none());
    }

    #[test]
    fn test_parse_redirect_and_error() {
        let xml = r#"<Autodiscover><Response><Account>
            <Action>redirectUrl</Action>
            <RedirectUrl>https://mail.example.net/autodiscover/autodiscover.xml</RedirectUrl>
        </Account></Response></Autodiscover>"#;
        let response = parse_autodiscover_xml(xml).unwrap();
        assert_eq!(response.action.as_deref(), Some("redirectUrl"));
        assert_eq!(
            response.redirect_url.as_deref(),
            Some("https://mail.example.net/autodiscover/autodiscover.xml")
        );

        let error = r#"<Autodiscover><Response><Error><ErrorCode>600</ErrorCode></Error></Response></Autodiscover>"#;
        let response = parse_autodiscover_xml(error).unwrap();
        assert_eq!(response.error_code.as_deref(), Some("600"));
        assert!(response.into_settings("example.com").is_none());
    }

    #[test]
    fn test_ssl_off_means_plaintext() {
        let protocol = OutlookProtocol {
            protocol_type: "IMAP".to_string(),
            server: Some("imap.example.com".to_string()),
            port: Some(143),
            ssl: Some("off".to_string()),
            encryption: None,
        };
        assert_eq!(protocol.security(), SecurityType::NONE);
    }

    #[test]
    fn test_request_body_contains_escaped_address() {
        let body = request_body("r&d@example.com");
        assert!(body.contains("<EMailAddress>r&amp;d@example.com</EMailAddress>"));
        assert!(body.contains(RESPONSE_SCHEMA));
    }

    #[test]
    fn test_redirect_url_must_be_https() {
        assert!(check_redirect_url("https://mail.example.net/autodiscover/autodiscover.xml").is_ok());
        assert!(check_redirect_url("http://mail.example.net/autodiscover/autodiscover.xml").is_err());
        assert!(check_redirect_url("not a url").is_err());
    }

    #[test]
    fn test_candidate_urls() {
        assert_eq!(
            OutlookAutodiscoverProbe::candidate_urls("example.com"),
            vec![
                "https://autodiscover.example.com/autodiscover/autodiscover.xml",
                "https://example.com/autodiscover/autodiscover.xml",
                OUTLOOK_FALLBACK_URL,
            ]
        );
        assert_eq!(OutlookAutodiscoverProbe::candidate_urls("10.0.0.1").len(), 2);
    }

    #[test]
    fn test_non_autodiscover_document_is_rejected() {
        assert!(parse_autodiscover_xml("<html><body>IIS</body></html>").is_err());
    }
}
