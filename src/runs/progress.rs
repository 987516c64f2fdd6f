use std::sync::Arc;

use super::registry::RunRegistry;

/// The one capability a job gets over its own run: reporting progress.
///
/// Values are clamped to 0-100 and never lower the stored percentage.
/// Reports after the run has left `running` are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    registry: Arc<RunRegistry>,
    run_id: String,
}

impl ProgressReporter {
    pub(crate) fn new(registry: Arc<RunRegistry>, run_id: impl Into<String>) -> Self {
        Self {
            registry,
            run_id: run_id.into(),
        }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        self.registry
            .update_progress(&self.run_id, percent, Some(message.into()));
    }
}
