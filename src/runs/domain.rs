use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::ResultRef;

/// Operations a run can perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ExportChat,
    ListChats,
    ListActiveChats,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExportChat => "export_chat",
            Self::ListChats => "list_chats",
            Self::ListActiveChats => "list_active_chats",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `pending -> running -> {completed | failed | cancelled}`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AuthExpired,
    Forbidden,
    NotFound,
    RateLimited,
    TransientFailure,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// One submitted job and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub action: ActionType,
    pub params: serde_json::Value,
    pub status: RunStatus,
    /// 0-100, never decreases.
    pub progress: u8,
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Only when failed.
    pub error: Option<RunFailure>,
    /// Only when completed.
    pub result_ref: Option<ResultRef>,
    pub summary: Option<serde_json::Value>,
}

impl Run {
    pub fn new(run_id: String, action: ActionType, params: serde_json::Value) -> Self {
        Self {
            run_id,
            action,
            params,
            status: RunStatus::Pending,
            progress: 0,
            progress_message: Some("Queued".to_string()),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            result_ref: None,
            summary: None,
        }
    }
}

/// History row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub action: ActionType,
    pub status: RunStatus,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<serde_json::Value>,
    pub error: Option<RunFailure>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            action: run.action,
            status: run.status,
            progress: run.progress,
            progress_message: run.progress_message.clone(),
            created_at: run.created_at,
            finished_at: run.finished_at,
            summary: run.summary.clone(),
            error: run.error.clone(),
        }
    }
}
