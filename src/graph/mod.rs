//! Microsoft Graph client.
//!
//! - [`backoff`]: retry delay policy and `Retry-After` parsing
//! - [`transport`]: authenticated GET over `reqwest`
//! - [`pagination`]: cursor draining with throttling-aware retries
//! - [`models`]: the payload fields the jobs read
//!
//! [`GraphClient`] wraps the fetcher with the handful of typed operations the
//! export and listing jobs need.

pub mod backoff;
pub mod error;
pub mod models;
pub mod pagination;
pub mod transport;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use backoff::BackoffPolicy;
pub use error::{GraphError, Result, TransportError};
pub use models::{Chat, ChatMember, ChatMessage, User};
pub use pagination::{Endpoint, PaginatedFetcher, Sleeper, TokioSleeper};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, StaticToken, TokenProvider};

/// Default `$top` for chat listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Server-side options for `/me/chats`.
#[derive(Debug, Clone, Default)]
pub struct ChatQuery {
    /// OData `$filter`, e.g. `chatType eq 'oneOnOne'`.
    pub filter: Option<String>,
    /// OData `$select`.
    pub select: Option<String>,
    /// Inline members with `$expand=members`.
    pub expand_members: bool,
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    fetcher: PaginatedFetcher,
    page_size: u32,
}

impl GraphClient {
    pub fn new(fetcher: PaginatedFetcher) -> Self {
        Self {
            fetcher,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// A client whose requests stop once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            fetcher: self.fetcher.with_cancellation(token),
            page_size: self.page_size,
        }
    }

    /// Profile of the signed-in user.
    pub async fn me(&self) -> Result<User> {
        self.fetcher.get_json(&Endpoint::new("me"), &[]).await
    }

    pub async fn chat(&self, chat_id: &str) -> Result<Chat> {
        debug!(chat_id, "Fetching chat");
        self.fetcher
            .get_json(&Endpoint::new("chats").segment(chat_id), &[])
            .await
    }

    pub async fn chat_members(&self, chat_id: &str) -> Result<Vec<ChatMember>> {
        self.fetcher
            .fetch_all_items(
                &Endpoint::new("chats").segment(chat_id).segment("members"),
                &[],
            )
            .await
    }

    /// Every chat of the signed-in user matching `query`.
    pub async fn chats<F>(&self, query: &ChatQuery, on_page: F) -> Result<Vec<Chat>>
    where
        F: FnMut(usize, &[Chat]) + Send,
    {
        let top = self.page_size.to_string();
        let mut params: Vec<(&str, &str)> = vec![("$top", top.as_str())];
        if query.expand_members {
            params.push(("$expand", "members"));
        }
        if let Some(select) = &query.select {
            params.push(("$select", select.as_str()));
        }
        if let Some(filter) = &query.filter {
            params.push(("$filter", filter.as_str()));
        }

        self.fetcher
            .fetch_all(&Endpoint::new("me/chats"), &params, on_page)
            .await
    }

    /// Messages modified inside `(since, until)`, newest modification first.
    ///
    /// The API only filters on `lastModifiedDateTime`, and requires a matching
    /// `$orderby`. Callers narrow to `createdDateTime` themselves.
    pub async fn chat_messages<F>(
        &self,
        chat_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        on_page: F,
    ) -> Result<Vec<ChatMessage>>
    where
        F: FnMut(usize, &[ChatMessage]) + Send,
    {
        let filter = format!(
            "lastModifiedDateTime gt {} and lastModifiedDateTime lt {}",
            odata_datetime(since),
            odata_datetime(until)
        );
        let params = [
            ("$filter", filter.as_str()),
            ("$orderby", "lastModifiedDateTime desc"),
        ];

        self.fetcher
            .fetch_all(
                &Endpoint::new("chats").segment(chat_id).segment("messages"),
                &params,
                on_page,
            )
            .await
    }

    /// Users whose UPN equals `query` (when it looks like an address) or whose
    /// display name starts with it.
    pub async fn search_users(&self, query: &str) -> Result<Vec<User>> {
        let literal = odata_string(query);
        let filter = if query.contains('@') {
            format!("userPrincipalName eq {literal}")
        } else {
            format!("startswith(displayName, {literal})")
        };
        let params = [
            ("$filter", filter.as_str()),
            ("$select", "id,displayName,userPrincipalName,mail"),
        ];

        self.fetcher
            .fetch_all_items(&Endpoint::new("users"), &params)
            .await
    }
}

fn odata_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Quote a value as an OData string literal.
fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
