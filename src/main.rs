//! Chat export server and command-line entry point.

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use mimalloc::MiMalloc;
use tracing::{error, info};

use chat_export::config::{AppConfig, Cli, Command};
use chat_export::oneshot::{self, Invocation};
use chat_export::{AppState, server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before reading any configuration
    let _ = dotenv();

    telemetry::init();

    let cli = Cli::parse();
    let config = match AppConfig::load_with_cli(&cli) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "Configuration error");
            std::process::exit(1);
        }
    };
    info!(config = ?config, "Configuration loaded");

    let state = AppState::from_config(config)?;

    let command = cli.command.unwrap_or(Command::Serve);
    match Invocation::from_command(&command)? {
        None => server::start_server(state).await,
        Some(invocation) => oneshot::run(&state, invocation).await,
    }
}
