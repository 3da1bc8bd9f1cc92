//! HTTP capability used by the protocol probes
//!
//! Probes never build their own client; they are handed an
//! [`HttpTransport`], which keeps them testable with scripted responders.

use crate::mail::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// A single outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
            content_type: None,
            timeout,
        }
    }

    pub fn post(
        url: impl Into<String>,
        body: impl Into<String>,
        content_type: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body.into()),
            content_type: Some(content_type.to_string()),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request. Non-2xx statuses are returned as responses, not errors.
    async fn send(&self, request: HttpRequest) -> DiscoveryResult<HttpResponse>;
}

/// Send one candidate request and return the body of a 2xx response.
///
/// The request timeout is enforced here as well, so a transport that ignores
/// it still cannot stall a probe.
pub(crate) async fn fetch_body(
    http: &dyn HttpTransport,
    request: HttpRequest,
) -> DiscoveryResult<String> {
    if request.timeout.is_zero() {
        return Err(DiscoveryError::Timeout(format!(
            "no time left for {}",
            request.url
        )));
    }

    let url = request.url.clone();
    let response = tokio::time::timeout(request.timeout, http.send(request))
        .await
        .map_err(|_| DiscoveryError::Timeout(url.clone()))??;

    if !response.is_success() {
        return Err(DiscoveryError::Status {
            status: response.status,
            url,
        });
    }
    Ok(response.body)
}

/// reqwest-backed transport sharing one connection pool
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> DiscoveryResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> DiscoveryResult<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);

        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}
