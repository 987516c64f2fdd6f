//! Chat export service.
//!
//! Exports Microsoft Teams conversations through the Graph API, either as a
//! one-shot command or as background runs driven from a browser.
//!
//! # Modules
//!
//! - [`graph`]: paginated, throttling-aware Graph client
//! - [`runs`]: run registry, bounded worker pool, result store
//! - [`export`]: the export and listing jobs
//! - [`api`]: HTTP routes and SSE progress stream
//! - [`oneshot`]: run a single job from the command line

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod api;
pub mod config;
pub mod export;
pub mod graph;
pub mod oneshot;
pub mod runs;
pub mod server;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use url::Url;

use crate::config::{AppConfig, GraphConfig, ResultStoreKind};
use crate::export::GraphJobCatalog;
use crate::graph::{
    BackoffPolicy, GraphClient, PaginatedFetcher, ReqwestTransport, StaticToken, TokenProvider,
};
use crate::runs::{FileResultStore, MemoryResultStore, ResultStore, RunManager};

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Run Manager
    pub run_manager: Arc<RunManager>,
    /// Bearer token source for Graph requests.
    pub tokens: Arc<dyn TokenProvider>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wire the Graph client, result store and run manager from configuration.
    pub fn from_config(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        let tokens: Arc<dyn TokenProvider> =
            Arc::new(StaticToken::new(config.graph.access_token.clone()));
        let client = build_graph_client(&config.graph, tokens.clone())?;

        let store: Arc<dyn ResultStore> = match config.runs.result_store {
            ResultStoreKind::File => Arc::new(FileResultStore::new(&config.runs.results_dir)),
            ResultStoreKind::Memory => Arc::new(MemoryResultStore::new()),
        };

        let run_manager = Arc::new(RunManager::new(
            store,
            Arc::new(GraphJobCatalog::new(client)),
            config.runs.max_concurrent,
        ));

        Ok(Self {
            run_manager,
            tokens,
            config,
        })
    }
}

pub fn build_graph_client(
    cfg: &GraphConfig,
    tokens: Arc<dyn TokenProvider>,
) -> anyhow::Result<GraphClient> {
    let base_url = Url::parse(&cfg.base_url)
        .with_context(|| format!("invalid graph.base_url: {}", cfg.base_url))?;
    let transport = ReqwestTransport::new(tokens, Duration::from_secs(cfg.request_timeout_secs))
        .context("failed to build HTTP client")?;

    let fetcher = PaginatedFetcher::new(Arc::new(transport), base_url)
        .with_max_retries(cfg.max_retries)
        .with_backoff(BackoffPolicy::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        ));

    Ok(GraphClient::new(fetcher).with_page_size(cfg.page_size))
}
