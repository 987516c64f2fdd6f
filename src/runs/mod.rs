//! Background runs.
//!
//! A [`RunManager`] accepts `(action, params)` submissions, validates them
//! through a [`JobCatalog`], and executes the resulting [`Job`]s on a bounded
//! pool. State lives in the [`registry::RunRegistry`]; payloads go to a
//! [`ResultStore`].

pub mod domain;
pub mod error;
pub mod job;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod store;

pub use domain::{ActionType, ErrorKind, Run, RunFailure, RunStatus, RunSummary};
pub use error::{JobError, RunError};
pub use job::{Job, JobCatalog, JobContext, JobOutput};
pub use manager::{DEFAULT_MAX_CONCURRENT, RunManager};
pub use progress::ProgressReporter;
pub use store::{FileResultStore, MemoryResultStore, ResultRef, ResultStore, StoreError};
