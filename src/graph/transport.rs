//! Authenticated HTTP transport.
//!
//! The fetcher only needs "GET this URL and give me the status, headers and
//! body". Keeping that behind a trait lets tests and alternative clients plug
//! in without touching the retry logic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tracing::{Level, enabled, trace};
use url::Url;

use super::error::TransportError;

/// Source of the bearer token attached to every request.
///
/// Token acquisition and caching live outside this crate; a provider that
/// returns `None` sends unauthenticated requests, which the API answers with 401.
pub trait TokenProvider: Send + Sync + fmt::Debug {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, typically from configuration or `GRAPH_ACCESS_TOKEN`.
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken")
            .field(&self.0.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Response as seen by the fetcher. Non-2xx statuses are data, not errors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    async fn get(&self, url: &Url) -> Result<HttpResponse, TransportError>;
}

/// `reqwest`-backed transport with a per-request timeout.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl ReqwestTransport {
    pub fn new(tokens: Arc<dyn TokenProvider>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;
        Ok(Self::with_client(client, tokens))
    }

    pub fn with_client(client: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { client, tokens }
    }

    fn map_error(err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse, TransportError> {
        if enabled!(Level::TRACE) {
            trace!("GET {url}");
        }

        let mut builder = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = self.tokens.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await.map_err(|e| Self::map_error(&e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| Self::map_error(&e))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
