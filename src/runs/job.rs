use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::domain::ActionType;
use super::error::JobError;
use super::progress::ProgressReporter;

/// What a job gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: String,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

/// A job's product: the payload kept in the result store, plus an optional
/// summary recorded on the run itself.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub payload: serde_json::Value,
    pub summary: Option<serde_json::Value>,
}

impl JobOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            summary: None,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = Some(summary);
        self
    }
}

/// One unit of background work. Jobs never schedule or poll themselves.
#[async_trait]
pub trait Job: Send + Sync {
    fn action(&self) -> ActionType;

    /// Normalized parameters, recorded on the run.
    fn params(&self) -> serde_json::Value;

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError>;
}

/// Turns an `(action, params)` submission into a validated job.
pub trait JobCatalog: Send + Sync + std::fmt::Debug {
    /// Fails with [`JobError::Validation`] when `params` don't fit `action`.
    fn build(
        &self,
        action: ActionType,
        params: serde_json::Value,
    ) -> Result<std::sync::Arc<dyn Job>, JobError>;
}
