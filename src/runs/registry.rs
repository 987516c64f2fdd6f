//! The table of runs.
//!
//! All reads and writes go through one `std::sync::RwLock`. Guards never
//! outlive a method call, so no lock is held across an `.await`. Every
//! committed change is published as a full snapshot on a broadcast channel.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::domain::{Run, RunFailure, RunStatus};
use super::store::ResultRef;

const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("run {run_id} cannot move from {from:?} to {to:?}")]
    Invalid {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
}

#[derive(Debug)]
struct RunEntry {
    run: Run,
    seq: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, RunEntry>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct RunRegistry {
    table: RwLock<Table>,
    events: broadcast::Sender<Run>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            table: RwLock::new(Table::default()),
            events,
        }
    }

    /// Register a pending run and return its cancellation token.
    pub fn insert(&self, run: Run) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let seq = table.next_seq;
        table.next_seq += 1;
        let _ = self.events.send(run.clone());
        table.entries.insert(
            run.run_id.clone(),
            RunEntry {
                run,
                seq,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(run_id).map(|e| e.run.clone())
    }

    /// All runs, newest first.
    pub fn list(&self) -> Vec<Run> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<&RunEntry> = table.entries.values().collect();
        entries.sort_by(|a, b| {
            b.run
                .created_at
                .cmp(&a.run.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|e| e.run.clone()).collect()
    }

    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(run_id).map(|e| e.cancel.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Run> {
        self.events.subscribe()
    }

    pub fn mark_running(&self, run_id: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunStatus::Running, |run| {
            run.started_at = Some(Utc::now());
            run.progress_message = Some("Starting".to_string());
        })
    }

    /// Raise a running run's progress. Lower values keep the current
    /// percentage but still update the message. Returns `false` when the run
    /// is unknown or not running.
    pub fn update_progress(&self, run_id: &str, percent: u8, message: Option<String>) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = table.entries.get_mut(run_id) else {
            return false;
        };
        if entry.run.status != RunStatus::Running {
            return false;
        }

        let percent = percent.min(100).max(entry.run.progress);
        if percent == entry.run.progress && message.is_none() {
            return true;
        }
        entry.run.progress = percent;
        if message.is_some() {
            entry.run.progress_message = message;
        }
        let _ = self.events.send(entry.run.clone());
        true
    }

    pub fn complete(
        &self,
        run_id: &str,
        result_ref: ResultRef,
        summary: Option<serde_json::Value>,
    ) -> Result<Run, TransitionError> {
        self.transition(run_id, RunStatus::Completed, |run| {
            run.progress = 100;
            run.progress_message = Some("Complete".to_string());
            run.result_ref = Some(result_ref);
            run.summary = summary;
        })
    }

    pub fn fail(&self, run_id: &str, failure: RunFailure) -> Result<Run, TransitionError> {
        self.transition(run_id, RunStatus::Failed, |run| {
            run.progress_message = Some(failure.message.clone());
            run.error = Some(failure);
        })
    }

    pub fn cancel(&self, run_id: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunStatus::Cancelled, |run| {
            run.progress_message = Some("Cancelled".to_string());
        })
    }

    fn transition(
        &self,
        run_id: &str,
        next: RunStatus,
        apply: impl FnOnce(&mut Run),
    ) -> Result<Run, TransitionError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table
            .entries
            .get_mut(run_id)
            .ok_or_else(|| TransitionError::NotFound(run_id.to_string()))?;

        let from = entry.run.status;
        if !from.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                run_id: run_id.to_string(),
                from,
                to: next,
            });
        }

        entry.run.status = next;
        if next.is_terminal() {
            entry.run.finished_at = Some(Utc::now());
        }
        apply(&mut entry.run);

        let snapshot = entry.run.clone();
        let _ = self.events.send(snapshot.clone());
        Ok(snapshot)
    }
}
