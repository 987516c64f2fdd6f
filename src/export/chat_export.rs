//! `export_chat`: every message of one chat inside a date range, or of every
//! chat shared with a set of participants.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use percent_encoding::percent_decode_str;
use serde_json::json;
use tracing::{debug, info};

use super::dates::parse_date;
use crate::graph::models::{Attachment, Chat, ChatMember, ChatMessage, User};
use crate::graph::{ChatQuery, GraphClient};
use crate::runs::{ActionType, Job, JobContext, JobError, JobOutput};

const TOP_SENDERS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportChatParams {
    /// Export this chat. Exactly one of `chat_id` and `participants` is set.
    #[serde(default)]
    pub chat_id: String,
    /// Display names or e-mails. Exports every chat the signed-in user
    /// shares with all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    /// Inclusive lower bound on `createdDateTime`.
    pub since: String,
    /// Exclusive upper bound; defaults to the time the run starts.
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub exclude_system_messages: bool,
    /// Keep only messages sent by the signed-in user.
    #[serde(default)]
    pub only_mine: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

impl From<&ChatMember> for Participant {
    fn from(member: &ChatMember) -> Self {
        Self {
            id: member.user_id.clone().unwrap_or_default(),
            display_name: member
                .display_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            email: member.email.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Sender {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportedAttachment {
    pub name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

impl From<&Attachment> for ExportedAttachment {
    fn from(att: &Attachment) -> Self {
        Self {
            name: att.name.clone().unwrap_or_default(),
            content_type: att.content_type.clone().unwrap_or_default(),
            content_url: att.content_url.clone(),
        }
    }
}

/// A message as written to the export document. The body is kept exactly as
/// the API delivered it, with its content type.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportedMessage {
    pub id: String,
    pub created_date_time: Option<DateTime<Utc>>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub from: Sender,
    pub body_content_type: String,
    pub body: String,
    pub attachments: Vec<ExportedAttachment>,
}

impl From<&ChatMessage> for ExportedMessage {
    fn from(msg: &ChatMessage) -> Self {
        let body = msg.body.clone().unwrap_or_default();
        Self {
            id: msg.id.clone(),
            created_date_time: msg.created_date_time,
            last_modified_date_time: msg.last_modified_date_time,
            from: Sender {
                id: msg.sender_id().unwrap_or_default().to_string(),
                display_name: msg.sender_name().to_string(),
            },
            body_content_type: body.content_type.unwrap_or_else(|| "text".to_string()),
            body: body.content.unwrap_or_default(),
            attachments: msg.attachments.iter().map(ExportedAttachment::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatExport {
    pub chat_id: String,
    pub chat_type: String,
    pub topic: Option<String>,
    pub participants: Vec<Participant>,
    pub date_range_start: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub exported_at_utc: DateTime<Utc>,
    pub message_count: usize,
    pub messages: Vec<ExportedMessage>,
}

/// Payload of a participant-based export.
#[derive(Debug, Clone, Serialize)]
pub struct SharedChatsExport {
    pub participants: Vec<String>,
    pub chat_count: usize,
    pub chats: Vec<ChatExport>,
}

/// Client-side narrowing applied after the server's coarse
/// `lastModifiedDateTime` filter.
#[derive(Debug, Clone)]
pub struct MessageSelection<'a> {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub author_id: Option<&'a str>,
    pub exclude_system_messages: bool,
}

impl MessageSelection<'_> {
    pub fn matches(&self, msg: &ChatMessage) -> bool {
        let Some(created) = msg.created_date_time else {
            return false;
        };
        if created < self.since || created >= self.until {
            return false;
        }
        if let Some(author) = self.author_id {
            if msg.sender_id() != Some(author) {
                return false;
            }
        }
        !(self.exclude_system_messages && msg.is_system_event())
    }

    /// Matching messages, oldest first.
    pub fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut selected: Vec<ChatMessage> =
            messages.into_iter().filter(|m| self.matches(m)).collect();
        selected.sort_by_key(|m| m.created_date_time);
        selected
    }
}

/// Progress while paging messages: 20% at the start, half a point per
/// message, never past 85%.
pub fn download_progress(downloaded: usize) -> u8 {
    u8::try_from((20 + downloaded / 2).min(85)).unwrap_or(85)
}

/// Sender display names by message count, highest first. Ties keep the
/// order in which senders first appear.
pub fn top_senders<'a>(
    messages: impl IntoIterator<Item = &'a ExportedMessage>,
    limit: usize,
) -> Vec<(String, usize)> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<&'a str, usize> = HashMap::new();
    for msg in messages {
        let name = msg.from.display_name.as_str();
        let count = counts.entry(name).or_insert(0);
        if *count == 0 {
            order.push(name.to_string());
        }
        *count += 1;
    }

    let mut ranked: Vec<(String, usize)> = order
        .into_iter()
        .map(|name| {
            let count = counts.get(name.as_str()).copied().unwrap_or(0);
            (name, count)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(limit);
    ranked
}

/// Chat ids copied out of Teams links arrive percent-encoded
/// (`19%3Aabc%40thread.v2`). Requests encode the id themselves.
fn normalize_chat_id(raw: &str) -> Result<String, JobError> {
    let id = raw.trim();
    if !id.contains('%') {
        return Ok(id.to_string());
    }
    percent_decode_str(id)
        .decode_utf8()
        .map(|decoded| decoded.trim().to_string())
        .map_err(|e| JobError::Validation(format!("chat_id is not valid once decoded: {e}")))
}

/// Pick the user a name or e-mail refers to among search results.
///
/// A single hit wins. Otherwise an exact, case-insensitive match on the
/// display name, then on the principal name, must be unique.
pub fn pick_user(identifier: &str, users: Vec<User>) -> Result<User, JobError> {
    if users.len() <= 1 {
        return users
            .into_iter()
            .next()
            .ok_or_else(|| JobError::Validation(format!("user not found: {identifier}")));
    }

    let wanted = identifier.to_lowercase();
    let exact = unique_match(&users, &wanted, |u| u.display_name.as_deref())
        .or_else(|| unique_match(&users, &wanted, |u| u.user_principal_name.as_deref()));
    if let Some(user) = exact {
        return Ok(user.clone());
    }

    let suggestions: Vec<String> = users
        .iter()
        .take(5)
        .map(|u| {
            format!(
                "{} ({})",
                u.display_name.as_deref().unwrap_or("?"),
                u.user_principal_name.as_deref().unwrap_or("?")
            )
        })
        .collect();
    Err(JobError::Validation(format!(
        "multiple users match '{identifier}', be more specific: {}",
        suggestions.join(", ")
    )))
}

fn unique_match<'a>(
    users: &'a [User],
    wanted: &str,
    field: impl Fn(&User) -> Option<&str>,
) -> Option<&'a User> {
    let mut hits = users
        .iter()
        .filter(|&u| field(u).is_some_and(|v| v.to_lowercase() == wanted));
    match (hits.next(), hits.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Whether every id in `user_ids` is a member of `chat`.
pub fn has_members(chat: &Chat, user_ids: &[String]) -> bool {
    let members = chat.members.as_deref().unwrap_or_default();
    user_ids
        .iter()
        .all(|id| members.iter().any(|m| m.user_id.as_deref() == Some(id.as_str())))
}

fn summarize(exports: &[ChatExport], since: DateTime<Utc>, until: DateTime<Utc>) -> serde_json::Value {
    let senders = top_senders(exports.iter().flat_map(|e| &e.messages), TOP_SENDERS);
    let mut participants: Vec<&str> = Vec::new();
    for p in exports.iter().flat_map(|e| &e.participants) {
        if !participants.contains(&p.display_name.as_str()) {
            participants.push(&p.display_name);
        }
    }
    let chat_type = match exports {
        [only] => only.chat_type.as_str(),
        _ => "multiple",
    };

    json!({
        "total_messages": exports.iter().map(|e| e.message_count).sum::<usize>(),
        "total_chats": exports.len(),
        "date_range_start": since,
        "date_range_end": until,
        "chat_type": chat_type,
        "top_senders": senders
            .iter()
            .map(|(name, count)| json!({"name": name, "count": count}))
            .collect::<Vec<_>>(),
        "participants": participants,
    })
}

#[derive(Debug, Clone)]
pub struct ExportChatJob {
    client: GraphClient,
    params: ExportChatParams,
    since: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
}

impl ExportChatJob {
    pub fn new(client: GraphClient, mut params: ExportChatParams) -> Result<Self, JobError> {
        params.chat_id = normalize_chat_id(&params.chat_id)?;
        params.participants = params
            .participants
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        match (params.chat_id.is_empty(), params.participants.is_empty()) {
            (true, true) => {
                return Err(JobError::Validation(
                    "chat_id or participants is required".to_string(),
                ));
            }
            (false, false) => {
                return Err(JobError::Validation(
                    "chat_id and participants are mutually exclusive".to_string(),
                ));
            }
            _ => {}
        }

        let since = parse_date(&params.since).map_err(|e| JobError::Validation(e.to_string()))?;
        let until = params
            .until
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_date)
            .transpose()
            .map_err(|e| JobError::Validation(e.to_string()))?;

        if let Some(until) = until {
            if until <= since {
                return Err(JobError::Validation(format!(
                    "until ({until}) must be after since ({since})"
                )));
            }
        }

        Ok(Self {
            client,
            params,
            since,
            until,
        })
    }

    /// Chats the signed-in user shares with every requested participant,
    /// members inlined.
    async fn shared_chats(&self, client: &GraphClient, me: &User) -> Result<Vec<Chat>, JobError> {
        let mut user_ids: Vec<String> = Vec::new();
        for identifier in &self.params.participants {
            let user = pick_user(identifier, client.search_users(identifier).await?)?;
            debug!(identifier = %identifier, user_id = %user.id, "Resolved participant");
            if !user_ids.contains(&user.id) {
                user_ids.push(user.id);
            }
        }
        if !user_ids.contains(&me.id) {
            user_ids.push(me.id.clone());
        }

        let query = ChatQuery {
            expand_members: true,
            ..ChatQuery::default()
        };
        let chats = client.chats(&query, |_, _| {}).await?;
        let scanned = chats.len();
        let shared: Vec<Chat> = chats
            .into_iter()
            .filter(|chat| has_members(chat, &user_ids))
            .collect();
        debug!(scanned, shared = shared.len(), "Matched chats by participants");

        if shared.is_empty() {
            return Err(JobError::Validation(format!(
                "no chats found with participants: {}",
                self.params.participants.join(", ")
            )));
        }
        Ok(shared)
    }

    async fn export_one(
        &self,
        client: &GraphClient,
        ctx: &JobContext,
        chat: &Chat,
        members: &[ChatMember],
        me: &User,
        until: DateTime<Utc>,
    ) -> Result<ChatExport, JobError> {
        let since = self.since;
        let progress = ctx.progress.clone();
        let raw = client
            .chat_messages(&chat.id, since, until, move |total, _| {
                progress.report(download_progress(total), format!("Downloaded {total} messages"));
            })
            .await?;
        let downloaded = raw.len();

        let selection = MessageSelection {
            since,
            until,
            author_id: self.params.only_mine.then_some(me.id.as_str()),
            exclude_system_messages: self.params.exclude_system_messages,
        };
        let messages: Vec<ExportedMessage> = selection
            .apply(raw)
            .iter()
            .map(ExportedMessage::from)
            .collect();
        debug!(chat_id = %chat.id, downloaded, kept = messages.len(), "Filtered messages");

        Ok(ChatExport {
            chat_id: chat.id.clone(),
            chat_type: chat.chat_type_or_unknown().to_string(),
            topic: chat.topic.clone(),
            participants: members.iter().map(Participant::from).collect(),
            date_range_start: since,
            date_range_end: until,
            exported_at_utc: Utc::now(),
            message_count: messages.len(),
            messages,
        })
    }
}

#[async_trait]
impl Job for ExportChatJob {
    fn action(&self) -> ActionType {
        ActionType::ExportChat
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        let client = self.client.with_cancellation(ctx.cancel.clone());
        let since = self.since;
        let until = self.until.unwrap_or_else(Utc::now);
        if until <= since {
            return Err(JobError::Validation(format!(
                "since ({since}) is in the future"
            )));
        }

        ctx.progress.report(10, "Fetching user profile");
        let me = client.me().await?;

        if self.params.participants.is_empty() {
            let chat_id = self.params.chat_id.as_str();
            ctx.progress.report(15, "Fetching chat info");
            let chat = client.chat(chat_id).await?;
            let members = client.chat_members(chat_id).await?;

            ctx.progress.report(20, "Downloading messages");
            let export = self
                .export_one(&client, &ctx, &chat, &members, &me, until)
                .await?;
            ctx.progress.report(85, "Processing messages");
            let summary = summarize(std::slice::from_ref(&export), since, until);

            info!(
                run_id = %ctx.run_id,
                chat_id,
                messages = export.message_count,
                "Chat exported"
            );
            let payload = serde_json::to_value(&export).map_err(anyhow::Error::from)?;
            return Ok(JobOutput::new(payload).with_summary(summary));
        }

        ctx.progress.report(12, "Resolving participants");
        let chats = self.shared_chats(&client, &me).await?;

        let total = chats.len();
        let mut exports = Vec::with_capacity(total);
        for (index, chat) in chats.iter().enumerate() {
            ctx.progress.report(20, format!("Exporting chat {} of {total}", index + 1));
            let members = chat.members.as_deref().unwrap_or_default();
            let export = self
                .export_one(&client, &ctx, chat, members, &me, until)
                .await?;
            if export.message_count == 0 {
                debug!(chat_id = %chat.id, "No messages in range");
                continue;
            }
            exports.push(export);
        }

        ctx.progress.report(85, "Processing messages");
        let summary = summarize(&exports, since, until);
        info!(
            run_id = %ctx.run_id,
            matched = total,
            exported = exports.len(),
            "Shared chats exported"
        );

        let payload = serde_json::to_value(SharedChatsExport {
            participants: self.params.participants.clone(),
            chat_count: exports.len(),
            chats: exports,
        })
        .map_err(anyhow::Error::from)?;
        Ok(JobOutput::new(payload).with_summary(summary))
    }
}
