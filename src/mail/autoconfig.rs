//! Mozilla ISPDB Auto-Configuration (Thunderbird-style)
//!
//! The Mozilla, Apple-style and generic well-known probes all speak the
//! `clientConfig` schema and differ only in where they look for it.

use crate::mail::config::{DetectionMethod, DiscoveryConfig, ProviderSettings, SecurityType};
use crate::mail::tier::{DiscoveryQuery, DiscoveryTier};
use crate::mail::transport::{fetch_body, HttpRequest, HttpTransport};
use crate::mail::validate::is_ip_literal;
use crate::mail::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::sync::Arc;
use std::time::Duration;

const ISPDB_URL: &str = "https://autoconfig.thunderbird.net/v1.1";

/// Where an autoconfig probe looks for `config-v1.1.xml`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoconfigFlavor {
    /// `autoconfig.<domain>`, the domain's well-known path, then the central ISPDB
    Mozilla,
    /// Apple-specific paths, rarely deployed
    Apple,
    /// Plain-HTTP well-known paths, tried last
    WellKnown,
}

impl AutoconfigFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            AutoconfigFlavor::Mozilla => "mozilla-autoconfig",
            AutoconfigFlavor::Apple => "apple-autoconfig",
            AutoconfigFlavor::WellKnown => "well-known-autoconfig",
        }
    }

    pub fn detection_method(&self) -> DetectionMethod {
        match self {
            AutoconfigFlavor::Mozilla => DetectionMethod::MozillaAutoconfig,
            AutoconfigFlavor::Apple => DetectionMethod::AppleAutoconfig,
            AutoconfigFlavor::WellKnown => DetectionMethod::WellKnownAutoconfig,
        }
    }

    /// Candidate URLs in the order they are tried.
    pub fn candidate_urls(&self, query: &DiscoveryQuery) -> Vec<String> {
        let domain = query.domain.as_str();
        let host = url_host(domain);
        // Subdomain-based hosts make no sense for IP literals.
        let named = !is_ip_literal(domain);
        let param = if query.synthesized_address {
            String::new()
        } else {
            format!("?emailaddress={}", urlencoding::encode(&query.address))
        };

        let mut urls = Vec::new();
        match self {
            AutoconfigFlavor::Mozilla => {
                if named {
                    urls.push(format!(
                        "https://autoconfig.{}/mail/config-v1.1.xml{}",
                        domain, param
                    ));
                }
                urls.push(format!(
                    "https://{}/.well-known/autoconfig/mail/config-v1.1.xml{}",
                    host, param
                ));
                if named {
                    urls.push(format!("{}/{}", ISPDB_URL, domain));
                }
            }
            AutoconfigFlavor::Apple => {
                urls.push(format!(
                    "https://{}/.well-known/apple/mail/config-v1.1.xml{}",
                    host, param
                ));
                if named {
                    urls.push(format!(
                        "https://mail.{}/.well-known/autoconfig/mail/config-v1.1.xml{}",
                        domain, param
                    ));
                }
            }
            AutoconfigFlavor::WellKnown => {
                urls.push(format!(
                    "http://{}/.well-known/autoconfig/mail/config-v1.1.xml{}",
                    host, param
                ));
                if named {
                    urls.push(format!(
                        "http://autoconfig.{}/mail/config-v1.1.xml{}",
                        domain, param
                    ));
                }
            }
        }
        urls
    }
}

/// Host part for a URL, bracketing IPv6 literals.
pub(crate) fn url_host(domain: &str) -> String {
    if domain.contains(':') {
        format!("[{}]", domain)
    } else {
        domain.to_string()
    }
}

/// Probe for one autoconfig flavor
pub struct AutoconfigProbe {
    flavor: AutoconfigFlavor,
    http: Arc<dyn HttpTransport>,
    request_timeout: Duration,
}

impl AutoconfigProbe {
    pub fn new(flavor: AutoconfigFlavor, http: Arc<dyn HttpTransport>, config: &DiscoveryConfig) -> Self {
        Self {
            flavor,
            http,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn flavor(&self) -> AutoconfigFlavor {
        self.flavor
    }
}

#[async_trait]
impl DiscoveryTier for AutoconfigProbe {
    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    async fn try_discover(&self, query: &DiscoveryQuery) -> DiscoveryResult<Option<ProviderSettings>> {
        let mut fault = None;

        for url in self.flavor.candidate_urls(query) {
            if query.is_expired() {
                log::debug!("{}: deadline reached before {}", self.name(), url);
                break;
            }

            log::debug!("{}: trying {}", self.name(), url);
            let request = HttpRequest::get(&url, query.clip(self.request_timeout));

            match fetch_body(self.http.as_ref(), request).await {
                Ok(xml) => {
                    match parse_autoconfig_xml(&xml)
                        .and_then(|doc| doc.into_settings(query, self.flavor.detection_method()))
                    {
                        Ok(settings) => {
                            log::info!("{}: found configuration at {}", self.name(), url);
                            return Ok(Some(settings));
                        }
                        Err(e) => log::debug!("{}: unusable document at {}: {}", self.name(), url, e),
                    }
                }
                Err(e) if e.is_candidate_failure() => {
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

// ============================================================================
// clientConfig schema
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct IspdbServer {
    server_type: String,
    hostname: Option<String>,
    port: Option<u16>,
    socket_type: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct IspdbDocument {
    display_name: Option<String>,
    incoming: Vec<IspdbServer>,
    outgoing: Vec<IspdbServer>,
}

impl IspdbDocument {
    fn into_settings(
        self,
        query: &DiscoveryQuery,
        method: DetectionMethod,
    ) -> DiscoveryResult<ProviderSettings> {
        let imap = self
            .incoming
            .iter()
            .find(|s| s.server_type.eq_ignore_ascii_case("imap") && s.hostname.is_some())
            .ok_or_else(|| DiscoveryError::Xml("no IMAP incomingServer".to_string()))?;
        let smtp = self
            .outgoing
            .iter()
            .find(|s| s.server_type.eq_ignore_ascii_case("smtp") && s.hostname.is_some())
            .ok_or_else(|| DiscoveryError::Xml("no SMTP outgoingServer".to_string()))?;

        let imap_security = SecurityType::from_socket_type(imap.socket_type.as_deref().unwrap_or(""));
        let smtp_security = SecurityType::from_socket_type(smtp.socket_type.as_deref().unwrap_or(""));

        Ok(ProviderSettings {
            display_name: self
                .display_name
                .map(|name| apply_placeholders(&name, query))
                .unwrap_or_else(|| query.domain.clone()),
            imap_host: apply_placeholders(imap.hostname.as_deref().unwrap_or_default(), query),
            imap_port: imap.port.unwrap_or_else(|| imap_security.default_imap_port()),
            imap_security,
            smtp_host: apply_placeholders(smtp.hostname.as_deref().unwrap_or_default(), query),
            smtp_port: smtp.port.unwrap_or_else(|| smtp_security.default_smtp_port()),
            smtp_security,
            detection_method: method,
        })
    }
}

/// Substitute ISPDB placeholders in hostnames and names
fn apply_placeholders(template: &str, query: &DiscoveryQuery) -> String {
    let local_part = query.address.split('@').next().unwrap_or_default();

    template
        .trim()
        .replace("%EMAILADDRESS%", &query.address)
        .replace("%EMAILLOCALPART%", local_part)
        .replace("%EMAILDOMAIN%", &query.domain)
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.to_string()))
}

/// Parse Mozilla autoconfig XML
fn parse_autoconfig_xml(xml: &str) -> DiscoveryResult<IspdbDocument> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut doc = IspdbDocument::default();
    let mut saw_provider = false;
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<(bool, IspdbServer)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                match name.as_str() {
                    "emailProvider" => saw_provider = true,
                    "incomingServer" | "outgoingServer" => {
                        let server = IspdbServer {
                            server_type: attribute(&e, b"type").unwrap_or_default(),
                            ..Default::default()
                        };
                        current = Some((name == "incomingServer", server));
                    }
                    _ => {}
                }
                path.push(name);
            }
            Event::Text(e) => {
                let text = e.unescape()?.trim().to_string();
                let element = path.last().map(String::as_str).unwrap_or_default();

                if let Some((_, server)) = current.as_mut() {
                    match element {
                        "hostname" => server.hostname = Some(text).filter(|h| !h.is_empty()),
                        "port" => server.port = text.parse::<u16>().ok().filter(|p| *p > 0),
                        "socketType" => server.socket_type = Some(text),
                        _ => {}
                    }
                } else if element == "displayName"
                    && path.len() >= 2
                    && path[path.len() - 2] == "emailProvider"
                    && doc.display_name.is_none()
                {
                    doc.display_name = Some(text);
                }
            }
            Event::End(_) => {
                if let Some(name) = path.pop() {
                    if name == "incomingServer" || name == "outgoingServer" {
                        if let Some((incoming, server)) = current.take() {
                            if incoming {
                                doc.incoming.push(server);
                            } else {
                                doc.outgoing.push(server);
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_provider {
        return Err(DiscoveryError::Xml("missing emailProvider element".to_string()));
    }

    Ok(doc)
}
