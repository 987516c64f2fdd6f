use thiserror::Error;

use super::domain::{ErrorKind, RunFailure};
use super::store::StoreError;
use crate::graph::GraphError;

/// Errors returned by the run manager's public operations.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("run not found: {0}")]
    NotFound(String),

    /// The run has not reached a terminal state yet.
    #[error("run {0} has not finished")]
    NotReady(String),

    #[error("run failed: {0}")]
    Failed(RunFailure),

    #[error("run {0} was cancelled")]
    Cancelled(String),

    #[error("run {0} has already finished")]
    AlreadyFinished(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a job ended when it didn't produce output.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error(transparent)]
    Graph(GraphError),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GraphError> for JobError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Cancelled => Self::Cancelled,
            other => Self::Graph(other),
        }
    }
}

impl JobError {
    /// Failure record for a run that ended with this error.
    pub fn to_failure(&self) -> RunFailure {
        let kind = match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Graph(err) => match err {
                GraphError::AuthExpired(_) => ErrorKind::AuthExpired,
                GraphError::Forbidden(_) => ErrorKind::Forbidden,
                GraphError::NotFound { .. } => ErrorKind::NotFound,
                GraphError::RateLimited { .. } => ErrorKind::RateLimited,
                GraphError::TransientFailure { .. } => ErrorKind::TransientFailure,
                _ => ErrorKind::Unknown,
            },
            Self::Cancelled | Self::Other(_) => ErrorKind::Unknown,
        };
        RunFailure::new(kind, self.to_string())
    }
}
