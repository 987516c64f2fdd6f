//! Where completed run payloads live.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no stored result for run {0}")]
    Missing(String),

    #[error("invalid result key: {0}")]
    InvalidKey(String),

    #[error("result store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored result is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Handle to a stored payload, recorded on the completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultRef {
    pub run_id: String,
    pub location: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ResultStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, run_id: &str, payload: &serde_json::Value) -> Result<ResultRef, StoreError>;
    async fn get(&self, run_id: &str) -> Result<serde_json::Value, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, run_id: &str, payload: &serde_json::Value) -> Result<ResultRef, StoreError> {
        let size_bytes = serde_json::to_vec(payload)?.len() as u64;
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string(), payload.clone());
        Ok(ResultRef {
            run_id: run_id.to_string(),
            location: format!("memory://{run_id}"),
            size_bytes,
        })
    }

    async fn get(&self, run_id: &str) -> Result<serde_json::Value, StoreError> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::Missing(run_id.to_string()))
    }
}

/// One pretty-printed `{run_id}.json` per run under `dir`.
#[derive(Debug, Clone)]
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(&self, run_id: &str, payload: &serde_json::Value) -> Result<ResultRef, StoreError> {
        let path = self.path_for(run_id)?;
        let bytes = serde_json::to_vec_pretty(payload)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(ResultRef {
            run_id: run_id.to_string(),
            location: path.display().to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn get(&self, run_id: &str) -> Result<serde_json::Value, StoreError> {
        let path = self.path_for(run_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}
