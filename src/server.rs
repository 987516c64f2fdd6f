use axum::{Router, extract::Request, http::StatusCode, middleware::Next, response::IntoResponse};
use std::time::Duration;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::api;

/// `/api` routes, with the static web UI as fallback.
pub fn build_app(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    let static_dir = state.config.server.static_dir.clone();

    Router::new()
        .nest("/api", api::router())
        .fallback_service(ServeDir::new(static_dir))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(request_timeout, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
                }
            },
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let static_dir = state.config.server.static_dir.display().to_string();
    let max_concurrent_runs = state.run_manager.max_concurrent();
    let authenticated = state.tokens.bearer_token().is_some();
    let run_manager = state.run_manager.clone();

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        static_dir = %static_dir,
        max_concurrent_runs,
        authenticated,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    run_manager.close();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
