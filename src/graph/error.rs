//! Error types for the Graph client.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure below the HTTP status line: the request never produced a response.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection, TLS, or body transfer failure.
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be constructed.
    #[error("invalid request: {0}")]
    Build(String),
}

impl TransportError {
    /// Whether retrying the identical request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }
}

/// Error surfaced by the paginated fetcher and the typed Graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The bearer token was rejected (HTTP 401). Re-authenticate and resubmit.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// The caller lacks permission (HTTP 403).
    #[error("access denied: {0}")]
    Forbidden(String),

    /// The resource does not exist (HTTP 404).
    #[error("resource not found: {url}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    NotFound { url: String, detail: Option<String> },

    /// Throttled on every attempt up to the retry ceiling.
    #[error("rate limited after {attempts} attempts: {last_error}")]
    RateLimited { attempts: u32, last_error: String },

    /// Transient failures (5xx gateway errors, timeouts, network) exhausted the retries.
    #[error("transient failure after {attempts} attempts: {last_error}")]
    TransientFailure { attempts: u32, last_error: String },

    /// Any other non-success status.
    #[error("HTTP {status}: {detail}")]
    Http { status: StatusCode, detail: String },

    /// Request could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Endpoint or cursor was not a valid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Response body did not match the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The operation was cancelled between pages or while waiting to retry.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for Graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = GraphError::NotFound {
            url: "https://graph/chats/x".into(),
            detail: Some("Chat not found".into()),
        };
        assert_eq!(
            err.to_string(),
            "resource not found: https://graph/chats/x (Chat not found)"
        );

        let bare = GraphError::NotFound {
            url: "https://graph/chats/x".into(),
            detail: None,
        };
        assert_eq!(bare.to_string(), "resource not found: https://graph/chats/x");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(!TransportError::Build("bad header".into()).is_transient());
    }
}
