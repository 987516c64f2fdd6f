use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::runs::{RunError, StoreError};

/// Error returned by API handlers, rendered as `{"error": ..., "kind": ...}`.
#[derive(Debug)]
pub enum ApiError {
    /// No bearer token is configured.
    Unauthorized,
    /// The request body was not the JSON the route expects.
    InvalidBody(JsonRejection),
    Run(RunError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody(rejection)
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        Self::Run(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "auth_required",
                "no access token configured; set GRAPH_ACCESS_TOKEN".to_string(),
            ),
            Self::InvalidBody(rejection) => {
                (rejection.status(), "validation", rejection.body_text())
            }
            Self::Run(err) => {
                let message = err.to_string();
                match err {
                    RunError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation", message),
                    RunError::NotFound(_) | RunError::Store(StoreError::Missing(_)) => {
                        (StatusCode::NOT_FOUND, "not_found", message)
                    }
                    RunError::NotReady(_) => (StatusCode::CONFLICT, "not_ready", message),
                    RunError::Failed(failure) => {
                        (StatusCode::CONFLICT, failure_kind(failure), message)
                    }
                    RunError::Cancelled(_) => (StatusCode::CONFLICT, "cancelled", message),
                    RunError::AlreadyFinished(_) => {
                        (StatusCode::CONFLICT, "already_finished", message)
                    }
                    RunError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store", message),
                }
            }
        }
    }
}

fn failure_kind(failure: &crate::runs::RunFailure) -> &'static str {
    use crate::runs::ErrorKind;
    match failure.kind {
        ErrorKind::Validation => "validation",
        ErrorKind::AuthExpired => "auth_expired",
        ErrorKind::Forbidden => "forbidden",
        ErrorKind::NotFound => "not_found",
        ErrorKind::RateLimited => "rate_limited",
        ErrorKind::TransientFailure => "transient_failure",
        ErrorKind::Unknown => "unknown",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}
