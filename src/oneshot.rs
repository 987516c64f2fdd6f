//! Run a single job from the command line and print its result.

use std::path::PathBuf;

use anyhow::{Context, bail};
use tokio::sync::broadcast;
use tracing::info;

use crate::AppState;
use crate::config::Command;
use crate::export::{ExportChatParams, ListActiveChatsParams, ListChatsParams};
use crate::runs::{ActionType, Run, RunStatus};

/// A subcommand translated into a run submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub action: ActionType,
    pub params: serde_json::Value,
    pub output: Option<PathBuf>,
}

impl Invocation {
    /// `None` for `serve`.
    pub fn from_command(command: &Command) -> anyhow::Result<Option<Self>> {
        let invocation = match command {
            Command::Serve => return Ok(None),
            Command::ExportChat {
                chat_id,
                participants,
                since,
                until,
                exclude_system_messages,
                only_mine,
                output,
            } => Self {
                action: ActionType::ExportChat,
                params: serde_json::to_value(ExportChatParams {
                    chat_id: chat_id.clone().unwrap_or_default(),
                    participants: non_empty(participants),
                    since: since.clone(),
                    until: until.clone(),
                    exclude_system_messages: *exclude_system_messages,
                    only_mine: *only_mine,
                })?,
                output: output.output.clone(),
            },
            Command::ListChats {
                chat_type,
                max_participants,
                topic_include,
                topic_exclude,
                participants,
                output,
            } => Self {
                action: ActionType::ListChats,
                params: serde_json::to_value(ListChatsParams {
                    chat_type: chat_type.clone(),
                    // Absent keeps the two-member default; 0 lifts the limit.
                    max_participants: match max_participants {
                        None => Some(2),
                        Some(0) => None,
                        Some(n) => Some(*n),
                    },
                    topic_include: non_empty(topic_include),
                    topic_exclude: non_empty(topic_exclude),
                    participants: non_empty(participants),
                })?,
                output: output.output.clone(),
            },
            Command::ListActiveChats {
                min_activity_days,
                max_meeting_participants,
                output,
            } => Self {
                action: ActionType::ListActiveChats,
                params: serde_json::to_value(ListActiveChatsParams {
                    min_activity_days: *min_activity_days,
                    max_meeting_participants: *max_meeting_participants,
                })?,
                output: output.output.clone(),
            },
        };
        Ok(Some(invocation))
    }
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Submit the job, log its progress, and write the payload once it completes.
pub async fn run(state: &AppState, invocation: Invocation) -> anyhow::Result<()> {
    if state.tokens.bearer_token().is_none() {
        bail!("no access token configured; set GRAPH_ACCESS_TOKEN or graph.access_token");
    }

    let manager = &state.run_manager;
    let mut events = manager.subscribe();
    let run_id = manager
        .submit(invocation.action, invocation.params)
        .context("failed to start run")?;
    info!(run_id = %run_id, action = %invocation.action, "Run submitted");

    let watched = run_id.clone();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(run) if run.run_id == watched => {
                    log_progress(&run);
                    if run.status.is_terminal() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let finished = manager.wait(&run_id).await?;
    logger.abort();

    match finished.status {
        RunStatus::Completed => {}
        RunStatus::Failed => {
            let reason = finished
                .error
                .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
            bail!("run {run_id} failed: {reason}");
        }
        RunStatus::Cancelled => bail!("run {run_id} was cancelled"),
        RunStatus::Pending | RunStatus::Running => bail!("run {run_id} did not finish"),
    }

    let payload = manager.get_result(&run_id).await?;
    let body = serde_json::to_string_pretty(&payload)?;

    match invocation.output {
        Some(path) => {
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{body}"),
    }

    if let Some(summary) = finished.summary {
        info!(summary = %summary, "Run complete");
    }
    Ok(())
}

fn log_progress(run: &Run) {
    info!(
        run_id = %run.run_id,
        status = ?run.status,
        progress = run.progress,
        "{}",
        run.progress_message.as_deref().unwrap_or("")
    );
}
