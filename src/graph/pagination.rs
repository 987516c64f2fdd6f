//! Cursor-paginated retrieval with throttling-aware retries.
//!
//! [`PaginatedFetcher::fetch_all`] drains a collection endpoint by following
//! `@odata.nextLink` cursors. Each request is retried on 429/502/503/504,
//! timeouts and network errors, waiting for the [`BackoffPolicy`] delay (or
//! the server's `Retry-After`) between attempts. Other failures abort the
//! whole fetch with a typed [`GraphError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::backoff::{BackoffPolicy, parse_retry_after};
use super::error::{GraphError, Result, TransportError};
use super::models::{ErrorEnvelope, Page};
use super::transport::{HttpResponse, HttpTransport};

/// Default retry ceiling per request.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Timer used between retries.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Path below the API base URL, kept as raw segments and percent-encoded
/// when the request URL is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    segments: Vec<String>,
}

impl Endpoint {
    /// Split a static path such as `/me/chats` into segments.
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Append one segment verbatim (it will be encoded, `/` included).
    #[must_use]
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

/// Outcome of a failed attempt that may be retried.
#[derive(Debug, Clone)]
struct RetryableFailure {
    throttled: bool,
    hint: Option<Duration>,
    message: String,
}

/// Per-request retry bookkeeping; dropped once the request resolves.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    last_error: Option<RetryableFailure>,
    next_delay: Duration,
}

enum Disposition {
    Retry(RetryableFailure),
    Fail(GraphError),
}

/// Drains cursor-paginated listings through an [`HttpTransport`].
#[derive(Clone, Debug)]
pub struct PaginatedFetcher {
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    base_url: Url,
    backoff: BackoffPolicy,
    max_retries: u32,
    cancel: Option<CancellationToken>,
}

impl PaginatedFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: Url) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            base_url,
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// A copy of this fetcher that stops between pages and during retry
    /// waits once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// GET a single resource.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.resolve(endpoint, query)?;
        let resp = self.get_with_retry(&url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    /// Fetch every page of a collection, in order.
    ///
    /// `on_page` receives the running item count and the items of the page
    /// that was just appended. Items are neither reordered nor deduplicated.
    pub async fn fetch_all<T, F>(
        &self,
        endpoint: &Endpoint,
        query: &[(&str, &str)],
        mut on_page: F,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
        F: FnMut(usize, &[T]) + Send,
    {
        let mut next = Some(self.resolve(endpoint, query)?);
        let mut items: Vec<T> = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            self.ensure_not_cancelled()?;

            let resp = self.get_with_retry(&url).await?;
            let page: Page<T> = serde_json::from_slice(&resp.body)?;
            pages += 1;

            let start = items.len();
            items.extend(page.value);
            on_page(items.len(), &items[start..]);

            debug!(
                endpoint = %url.path(),
                page = pages,
                page_items = items.len() - start,
                total = items.len(),
                has_more = page.next_link.is_some(),
                "Fetched page"
            );

            next = match page.next_link {
                Some(link) => Some(self.cursor_url(&link)?),
                None => None,
            };
        }

        Ok(items)
    }

    /// Convenience wrapper for callers that don't track progress.
    pub async fn fetch_all_items<T>(&self, endpoint: &Endpoint, query: &[(&str, &str)]) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.fetch_all(endpoint, query, |_, _: &[T]| {}).await
    }

    async fn get_with_retry(&self, url: &Url) -> Result<HttpResponse> {
        let mut state = RetryState::default();

        loop {
            self.ensure_not_cancelled()?;

            let failure = match self.transport.get(url).await {
                Ok(resp) if resp.status.is_success() => return Ok(resp),
                Ok(resp) => match classify(url, &resp) {
                    Disposition::Retry(failure) => failure,
                    Disposition::Fail(err) => return Err(err),
                },
                Err(err) if err.is_transient() => RetryableFailure {
                    throttled: false,
                    hint: None,
                    message: err.to_string(),
                },
                Err(err) => return Err(err.into()),
            };

            state.attempt += 1;
            let failure = state.last_error.insert(failure);
            if state.attempt > self.max_retries {
                warn!(
                    url = %url,
                    attempts = state.attempt,
                    error = %failure.message,
                    "Giving up after exhausting retries"
                );
                return Err(exhausted(state.attempt, failure.clone()));
            }

            state.next_delay = self.backoff.delay(state.attempt, failure.hint);
            warn!(
                url = %url,
                attempt = state.attempt,
                max_retries = self.max_retries,
                delay_ms = u64::try_from(state.next_delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure.message,
                "Request failed, retrying"
            );
            self.pause(state.next_delay).await?;
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Err(GraphError::Cancelled),
                    () = self.sleeper.sleep(delay) => Ok(()),
                }
            }
            None => {
                self.sleeper.sleep(delay).await;
                Ok(())
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(GraphError::Cancelled),
            _ => Ok(()),
        }
    }

    fn resolve(&self, endpoint: &Endpoint, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                TransportError::Build(format!("{} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(endpoint.segments());
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Cursors are absolute URLs; refuse to send the bearer token anywhere else.
    fn cursor_url(&self, link: &str) -> Result<Url> {
        let url = Url::parse(link)?;
        if url.origin() != self.base_url.origin() {
            return Err(TransportError::Build(format!(
                "continuation link {url} leaves the API origin"
            ))
            .into());
        }
        Ok(url)
    }
}

fn classify(url: &Url, resp: &HttpResponse) -> Disposition {
    let detail = error_detail(resp);
    match resp.status {
        StatusCode::TOO_MANY_REQUESTS => Disposition::Retry(RetryableFailure {
            throttled: true,
            hint: retry_after(resp),
            message: format!("HTTP 429: {detail}"),
        }),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Disposition::Retry(RetryableFailure {
                throttled: false,
                hint: retry_after(resp),
                message: format!("HTTP {}: {detail}", resp.status.as_u16()),
            })
        }
        StatusCode::UNAUTHORIZED => Disposition::Fail(GraphError::AuthExpired(detail)),
        StatusCode::FORBIDDEN => Disposition::Fail(GraphError::Forbidden(detail)),
        StatusCode::NOT_FOUND => Disposition::Fail(GraphError::NotFound {
            url: url.to_string(),
            detail: (!resp.body.is_empty()).then_some(detail),
        }),
        status => Disposition::Fail(GraphError::Http { status, detail }),
    }
}

fn exhausted(attempts: u32, failure: RetryableFailure) -> GraphError {
    if failure.throttled {
        GraphError::RateLimited {
            attempts,
            last_error: failure.message,
        }
    } else {
        GraphError::TransientFailure {
            attempts,
            last_error: failure.message,
        }
    }
}

fn retry_after(resp: &HttpResponse) -> Option<Duration> {
    resp.headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

/// Prefer the API's `error.message`, then the raw body, then the reason phrase.
fn error_detail(resp: &HttpResponse) -> String {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&resp.body) {
        if let Some(message) = envelope.error.message.filter(|m| !m.is_empty()) {
            return message;
        }
        if let Some(code) = envelope.error.code {
            return code;
        }
    }

    let text = String::from_utf8_lossy(&resp.body);
    let text = text.trim();
    if text.is_empty() {
        resp.status
            .canonical_reason()
            .unwrap_or("no details")
            .to_string()
    } else {
        text.chars().take(300).collect()
    }
}
