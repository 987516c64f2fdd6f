//! `list_chats` and `list_active_chats`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::graph::models::{Chat, ChatMember};
use crate::graph::{ChatQuery, GraphClient, GraphError};
use crate::runs::{ActionType, Job, JobContext, JobError, JobOutput, ProgressReporter};

/// Chat types the API filters on server-side.
const CHAT_TYPES: [&str; 3] = ["oneOnOne", "group", "meeting"];

const NO_NAME: &str = "(No name)";

fn default_chat_type() -> String {
    "oneOnOne".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_participants() -> Option<usize> {
    Some(2)
}

fn default_min_activity_days() -> u32 {
    365
}

fn default_max_meeting_participants() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListChatsParams {
    /// `oneOnOne`, `group`, `meeting`, or `all`.
    #[serde(default = "default_chat_type")]
    pub chat_type: String,
    /// `null` lifts the limit.
    #[serde(default = "default_max_participants")]
    pub max_participants: Option<usize>,
    /// Keep chats whose topic contains any of these (case-insensitive).
    #[serde(default)]
    pub topic_include: Vec<String>,
    /// Drop chats whose topic contains any of these (case-insensitive).
    #[serde(default)]
    pub topic_exclude: Vec<String>,
    /// Keep chats with at least one member having one of these e-mails.
    #[serde(default)]
    pub participants: Vec<String>,
}

impl Default for ListChatsParams {
    fn default() -> Self {
        Self {
            chat_type: default_chat_type(),
            max_participants: default_max_participants(),
            topic_include: Vec::new(),
            topic_exclude: Vec::new(),
            participants: Vec::new(),
        }
    }
}

impl ListChatsParams {
    fn validate(&self) -> Result<(), JobError> {
        if self.chat_type != "all" && !CHAT_TYPES.contains(&self.chat_type.as_str()) {
            return Err(JobError::Validation(format!(
                "chat_type must be one of {}, or all; got {:?}",
                CHAT_TYPES.join(", "),
                self.chat_type
            )));
        }
        Ok(())
    }

    /// Client-side part of the filter; the chat type is also applied here in
    /// case the server ignored `$filter`.
    pub fn matches(&self, chat: &Chat, members: &[ChatMember]) -> bool {
        if self.chat_type != "all" && chat.chat_type_or_unknown() != self.chat_type {
            return false;
        }

        if let Some(max) = self.max_participants {
            if members.len() > max {
                return false;
            }
        }

        let topic = chat.topic.as_deref().unwrap_or_default().to_lowercase();
        if !self.topic_include.is_empty()
            && !self
                .topic_include
                .iter()
                .any(|kw| topic.contains(&kw.to_lowercase()))
        {
            return false;
        }
        if self
            .topic_exclude
            .iter()
            .any(|kw| topic.contains(&kw.to_lowercase()))
        {
            return false;
        }

        if !self.participants.is_empty() && !members.is_empty() {
            let emails: Vec<String> = members
                .iter()
                .filter_map(|m| m.email.as_deref())
                .map(str::to_lowercase)
                .collect();
            if !self
                .participants
                .iter()
                .any(|p| emails.contains(&p.to_lowercase()))
            {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListActiveChatsParams {
    /// Only chats active within this many days; 0 keeps all.
    #[serde(default = "default_min_activity_days")]
    pub min_activity_days: u32,
    /// Meetings with more members are skipped; 0 lifts the limit.
    #[serde(default = "default_max_meeting_participants")]
    pub max_meeting_participants: usize,
}

impl Default for ListActiveChatsParams {
    fn default() -> Self {
        Self {
            min_activity_days: default_min_activity_days(),
            max_meeting_participants: default_max_meeting_participants(),
        }
    }
}

impl ListActiveChatsParams {
    /// Channels are never listed. Chats without a known last activity are kept.
    pub fn matches(
        &self,
        chat: &Chat,
        members: &[ChatMember],
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match chat.chat_type_or_unknown() {
            "channel" => return false,
            "meeting"
                if self.max_meeting_participants > 0
                    && members.len() > self.max_meeting_participants =>
            {
                return false;
            }
            _ => {}
        }

        match last_activity {
            Some(at) if self.min_activity_days > 0 => {
                at >= now - Duration::days(i64::from(self.min_activity_days))
            }
            _ => true,
        }
    }
}

/// One row of a chat listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRow {
    pub chat_id: String,
    pub chat_type: String,
    pub topic: Option<String>,
    pub display_name: String,
    pub member_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ChatRow {
    pub fn new(chat: &Chat, members: &[ChatMember]) -> Self {
        Self {
            chat_id: chat.id.clone(),
            chat_type: chat.chat_type_or_unknown().to_string(),
            topic: chat
                .topic
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string),
            display_name: display_name(chat, members),
            member_count: members.len(),
            last_activity: last_activity(chat),
        }
    }
}

/// The topic, else the members' names, else `(No name)`.
pub fn display_name(chat: &Chat, members: &[ChatMember]) -> String {
    if let Some(topic) = chat.topic.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return topic.to_string();
    }

    let names: Vec<&str> = members
        .iter()
        .filter_map(|m| m.display_name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        NO_NAME.to_string()
    } else {
        names.join(", ")
    }
}

/// When the chat's last message was sent, from its preview.
pub fn last_activity(chat: &Chat) -> Option<DateTime<Utc>> {
    chat.last_message_preview.as_ref()?.created_date_time
}

fn scan_progress(scanned: usize) -> u8 {
    u8::try_from((10 + scanned).min(90)).unwrap_or(90)
}

/// Members from `$expand`, else a separate lookup.
async fn resolve_members(client: &GraphClient, chat: &Chat) -> Result<Vec<ChatMember>, GraphError> {
    match &chat.members {
        Some(members) => Ok(members.clone()),
        None => client.chat_members(&chat.id).await,
    }
}

async fn fetch_chats(
    client: &GraphClient,
    query: &ChatQuery,
    progress: &ProgressReporter,
) -> Result<Vec<Chat>, GraphError> {
    progress.report(10, "Fetching chats");
    let reporter = progress.clone();
    client
        .chats(query, move |total, _| {
            reporter.report(scan_progress(total / 2), format!("Fetched {total} chats"));
        })
        .await
}

fn listing_output(rows: &[ChatRow], scanned: usize) -> JobOutput {
    let total = rows.len();
    JobOutput::new(json!({ "chats": rows, "total": total })).with_summary(json!({
        "total_chats": total,
        "scanned_chats": scanned,
    }))
}

#[derive(Debug, Clone)]
pub struct ListChatsJob {
    client: GraphClient,
    params: ListChatsParams,
}

impl ListChatsJob {
    pub fn new(client: GraphClient, params: ListChatsParams) -> Result<Self, JobError> {
        params.validate()?;
        Ok(Self { client, params })
    }
}

#[async_trait]
impl Job for ListChatsJob {
    fn action(&self) -> ActionType {
        ActionType::ListChats
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        let client = self.client.with_cancellation(ctx.cancel.clone());
        let query = ChatQuery {
            filter: (self.params.chat_type != "all")
                .then(|| format!("chatType eq '{}'", self.params.chat_type)),
            select: None,
            expand_members: true,
        };

        let chats = fetch_chats(&client, &query, &ctx.progress).await?;

        let mut rows = Vec::new();
        for (i, chat) in chats.iter().enumerate() {
            let members = match resolve_members(&client, chat).await {
                Ok(members) => members,
                Err(GraphError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    warn!(chat_id = %chat.id, error = %e, "Could not load members");
                    Vec::new()
                }
            };

            if self.params.matches(chat, &members) {
                rows.push(ChatRow::new(chat, &members));
            }

            let scanned = i + 1;
            if scanned % 5 == 0 {
                ctx.progress.report(
                    scan_progress(scanned),
                    format!("Processed {scanned} chats, {} match", rows.len()),
                );
            }
        }

        info!(run_id = %ctx.run_id, scanned = chats.len(), matched = rows.len(), "Chats listed");
        Ok(listing_output(&rows, chats.len()))
    }
}

#[derive(Debug, Clone)]
pub struct ListActiveChatsJob {
    client: GraphClient,
    params: ListActiveChatsParams,
}

impl ListActiveChatsJob {
    pub fn new(client: GraphClient, params: ListActiveChatsParams) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl Job for ListActiveChatsJob {
    fn action(&self) -> ActionType {
        ActionType::ListActiveChats
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        let client = self.client.with_cancellation(ctx.cancel.clone());
        let query = ChatQuery {
            filter: None,
            select: Some("id,chatType,topic,lastMessagePreview".to_string()),
            expand_members: true,
        };

        let chats = fetch_chats(&client, &query, &ctx.progress).await?;
        let now = Utc::now();

        let mut rows = Vec::new();
        for (i, chat) in chats.iter().enumerate() {
            let scanned = i + 1;
            if scanned % 5 == 0 {
                ctx.progress.report(
                    scan_progress(scanned),
                    format!("Processed {scanned} chats, {} active", rows.len()),
                );
            }

            if chat.chat_type_or_unknown() == "channel" {
                continue;
            }

            let members = match resolve_members(&client, chat).await {
                Ok(members) => members,
                Err(GraphError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    warn!(chat_id = %chat.id, error = %e, "Skipping chat, members unavailable");
                    continue;
                }
            };

            if self.params.matches(chat, &members, last_activity(chat), now) {
                rows.push(ChatRow::new(chat, &members));
            }
        }

        // Most recent first; chats with no known activity go last.
        rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        info!(run_id = %ctx.run_id, scanned = chats.len(), active = rows.len(), "Active chats listed");
        Ok(listing_output(&rows, chats.len()))
    }
}
