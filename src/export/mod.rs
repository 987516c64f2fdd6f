//! The jobs this service runs against the Graph API.

pub mod chat_export;
pub mod chat_list;
pub mod dates;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::graph::GraphClient;
use crate::runs::{ActionType, Job, JobCatalog, JobError};

pub use chat_export::{ExportChatJob, ExportChatParams};
pub use chat_list::{ListActiveChatsJob, ListActiveChatsParams, ListChatsJob, ListChatsParams};
pub use dates::{DateParseError, parse_date};

/// Builds export and listing jobs bound to one [`GraphClient`].
#[derive(Debug, Clone)]
pub struct GraphJobCatalog {
    client: GraphClient,
}

impl GraphJobCatalog {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, JobError> {
    serde_json::from_value(params).map_err(|e| JobError::Validation(e.to_string()))
}

impl JobCatalog for GraphJobCatalog {
    fn build(
        &self,
        action: ActionType,
        params: serde_json::Value,
    ) -> Result<Arc<dyn Job>, JobError> {
        let client = self.client.clone();
        let job: Arc<dyn Job> = match action {
            ActionType::ExportChat => Arc::new(ExportChatJob::new(client, parse_params(params)?)?),
            ActionType::ListChats => Arc::new(ListChatsJob::new(client, parse_params(params)?)?),
            ActionType::ListActiveChats => {
                Arc::new(ListActiveChatsJob::new(client, parse_params(params)?))
            }
        };
        Ok(job)
    }
}
