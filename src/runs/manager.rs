use std::any::Any;
use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::domain::{ActionType, ErrorKind, Run, RunFailure, RunStatus, RunSummary};
use super::error::{JobError, RunError};
use super::job::{Job, JobCatalog, JobContext, JobOutput};
use super::progress::ProgressReporter;
use super::registry::RunRegistry;
use super::store::ResultStore;

/// Default size of the worker pool.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Accepts submissions and drives each run through its lifecycle on a
/// bounded worker pool.
#[derive(Clone, Debug)]
pub struct RunManager {
    registry: Arc<RunRegistry>,
    store: Arc<dyn ResultStore>,
    catalog: Arc<dyn JobCatalog>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl RunManager {
    pub fn new(
        store: Arc<dyn ResultStore>,
        catalog: Arc<dyn JobCatalog>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry: Arc::new(RunRegistry::new()),
            store,
            catalog,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stop handing out worker slots. Runs still waiting for one fail;
    /// runs already executing are unaffected.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Validate `params` for `action` and queue a run. Returns the run id.
    #[instrument(skip(self, params), fields(run_id = tracing::field::Empty))]
    pub fn submit(&self, action: ActionType, params: serde_json::Value) -> Result<String, RunError> {
        if params.is_null() {
            return Err(RunError::Validation("params must not be null".to_string()));
        }

        let job = self.catalog.build(action, params).map_err(|e| match e {
            JobError::Validation(msg) => RunError::Validation(msg),
            other => RunError::Validation(other.to_string()),
        })?;

        let run_id = self.submit_job(job);
        tracing::Span::current().record("run_id", run_id.as_str());
        Ok(run_id)
    }

    /// Queue an already validated job.
    pub fn submit_job(&self, job: Arc<dyn Job>) -> String {
        let run_id = Uuid::new_v4().simple().to_string();
        let run = Run::new(run_id.clone(), job.action(), job.params());
        let cancel = self.registry.insert(run);

        info!(run_id = %run_id, action = %job.action(), "Run queued");

        let manager = self.clone();
        let worker_id = run_id.clone();
        tokio::spawn(async move {
            manager.drive(worker_id, job, cancel).await;
        });

        run_id
    }

    pub fn get_status(&self, run_id: &str) -> Result<Run, RunError> {
        self.registry
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    /// The stored payload of a completed run.
    pub async fn get_result(&self, run_id: &str) -> Result<serde_json::Value, RunError> {
        let run = self.get_status(run_id)?;
        match run.status {
            RunStatus::Completed => Ok(self.store.get(run_id).await?),
            RunStatus::Failed => Err(RunError::Failed(run.error.unwrap_or_else(|| {
                RunFailure::new(ErrorKind::Unknown, "run failed without details")
            }))),
            RunStatus::Cancelled => Err(RunError::Cancelled(run.run_id)),
            RunStatus::Pending | RunStatus::Running => Err(RunError::NotReady(run.run_id)),
        }
    }

    /// Every known run, newest first.
    pub fn list_history(&self) -> Vec<RunSummary> {
        self.registry.list().iter().map(RunSummary::from).collect()
    }

    /// Request cancellation. Pending runs are cancelled as soon as their
    /// worker gets a slot; running jobs are stopped at the next checkpoint.
    #[instrument(skip(self))]
    pub fn cancel(&self, run_id: &str) -> Result<Run, RunError> {
        let run = self.get_status(run_id)?;
        if run.status.is_terminal() {
            return Err(RunError::AlreadyFinished(run.run_id));
        }
        if let Some(token) = self.registry.cancel_token(run_id) {
            token.cancel();
        }
        info!("Cancellation requested");
        self.get_status(run_id)
    }

    /// Resolve once the run reaches a terminal state.
    pub async fn wait(&self, run_id: &str) -> Result<Run, RunError> {
        let mut rx = self.registry.subscribe();
        loop {
            let run = self.get_status(run_id)?;
            if run.status.is_terminal() {
                return Ok(run);
            }

            loop {
                match rx.recv().await {
                    Ok(snapshot) if snapshot.run_id == run_id && snapshot.status.is_terminal() => {
                        return Ok(snapshot);
                    }
                    Ok(_) => {}
                    // Missed events; re-read the registry.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RunError::NotReady(run_id.to_string()));
                    }
                }
            }
        }
    }

    /// Snapshots of every committed run change.
    pub fn subscribe(&self) -> broadcast::Receiver<Run> {
        self.registry.subscribe()
    }

    #[instrument(skip(self, job, cancel), fields(action = %job.action()))]
    async fn drive(self, run_id: String, job: Arc<dyn Job>, cancel: CancellationToken) {
        // Held until this function returns, whatever the outcome.
        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            error!("Worker pool closed");
            match self.registry.mark_running(&run_id) {
                Ok(_) => self.finish_failed(
                    &run_id,
                    RunFailure::new(ErrorKind::Unknown, "worker pool closed"),
                ),
                Err(e) => warn!(error = %e, "Run could not start"),
            }
            return;
        };

        if let Err(e) = self.registry.mark_running(&run_id) {
            warn!(error = %e, "Run could not start");
            return;
        }

        if cancel.is_cancelled() {
            self.finish_cancelled(&run_id);
            return;
        }

        info!("Run started");

        let ctx = JobContext {
            run_id: run_id.clone(),
            progress: ProgressReporter::new(self.registry.clone(), run_id.clone()),
            cancel: cancel.clone(),
        };
        let mut handle = tokio::spawn(async move { job.run(ctx).await });

        let joined = tokio::select! {
            biased;
            joined = &mut handle => joined,
            () = cancel.cancelled() => {
                handle.abort();
                debug!("Aborted job after cancellation");
                self.finish_cancelled(&run_id);
                return;
            }
        };

        match joined {
            Ok(Ok(output)) => self.finish_completed(&run_id, output).await,
            Ok(Err(JobError::Cancelled)) => self.finish_cancelled(&run_id),
            Ok(Err(e)) => {
                warn!(error = %e, "Run failed");
                self.finish_failed(&run_id, e.to_failure());
            }
            Err(e) => self.finish_joined_error(&run_id, e),
        }
    }

    async fn finish_completed(&self, run_id: &str, output: JobOutput) {
        match self.store.put(run_id, &output.payload).await {
            Ok(result_ref) => match self.registry.complete(run_id, result_ref, output.summary) {
                Ok(run) => info!(
                    duration_ms = run
                        .started_at
                        .zip(run.finished_at)
                        .map(|(s, f)| (f - s).num_milliseconds()),
                    "Run completed"
                ),
                Err(e) => warn!(error = %e, "Could not record completion"),
            },
            Err(e) => {
                error!(error = %e, "Could not store result");
                self.finish_failed(
                    run_id,
                    RunFailure::new(ErrorKind::Unknown, format!("failed to store result: {e}")),
                );
            }
        }
    }

    fn finish_failed(&self, run_id: &str, failure: RunFailure) {
        if let Err(e) = self.registry.fail(run_id, failure) {
            warn!(error = %e, "Could not record failure");
        }
    }

    fn finish_cancelled(&self, run_id: &str) {
        match self.registry.cancel(run_id) {
            Ok(_) => info!("Run cancelled"),
            Err(e) => warn!(error = %e, "Could not record cancellation"),
        }
    }

    fn finish_joined_error(&self, run_id: &str, err: JoinError) {
        if err.is_panic() {
            let message = panic_message(&*err.into_panic());
            error!(panic = %message, "Job panicked");
            self.finish_failed(
                run_id,
                RunFailure::new(ErrorKind::Unknown, format!("job panicked: {message}")),
            );
        } else {
            self.finish_cancelled(run_id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
