use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::sse::{build_sse_response, follow_run};
use crate::AppState;
use crate::runs::{ActionType, Run, RunStatus, RunSummary};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(create_run))
        .route("/runs/export-chat", post(create_export_chat))
        .route("/runs/list-chats", post(create_list_chats))
        .route("/runs/list-active-chats", post(create_list_active_chats))
        .route("/runs/history", get(history))
        .route("/runs/{id}/status", get(status))
        .route("/runs/{id}/results", get(results))
        .route("/runs/{id}/download", get(download))
        .route("/runs/{id}/cancel", post(cancel))
        .route("/runs/{id}/events", get(events))
}

#[derive(Deserialize)]
struct CreateRunRequest {
    action: ActionType,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Serialize)]
struct RunCreated {
    run_id: String,
    action: ActionType,
    status: RunStatus,
    created_at: DateTime<Utc>,
    status_url: String,
}

#[derive(Serialize)]
struct History {
    runs: Vec<RunSummary>,
    total: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "authenticated": state.tokens.bearer_token().is_some(),
        "max_concurrent_runs": state.run_manager.max_concurrent(),
    }))
}

fn submit(
    state: &AppState,
    action: ActionType,
    params: serde_json::Value,
) -> Result<(StatusCode, Json<RunCreated>), ApiError> {
    if state.tokens.bearer_token().is_none() {
        return Err(ApiError::Unauthorized);
    }

    let run_id = state.run_manager.submit(action, params)?;
    let run = state.run_manager.get_status(&run_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunCreated {
            status_url: format!("/api/runs/{run_id}/status"),
            run_id,
            action: run.action,
            status: run.status,
            created_at: run.created_at,
        }),
    ))
}

async fn create_run(
    State(state): State<AppState>,
    req: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    submit(&state, req.action, req.params)
}

async fn create_export_chat(
    State(state): State<AppState>,
    params: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(params) = params?;
    submit(&state, ActionType::ExportChat, params)
}

async fn create_list_chats(
    State(state): State<AppState>,
    params: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(params) = params?;
    submit(&state, ActionType::ListChats, params)
}

async fn create_list_active_chats(
    State(state): State<AppState>,
    params: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(params) = params?;
    submit(&state, ActionType::ListActiveChats, params)
}

async fn history(State(state): State<AppState>) -> Json<History> {
    let runs = state.run_manager.list_history();
    Json(History {
        total: runs.len(),
        runs,
    })
}

async fn status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.run_manager.get_status(&run_id)?))
}

async fn results(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = state.run_manager.get_result(&run_id).await?;
    let run = state.run_manager.get_status(&run_id)?;
    Ok(Json(json!({
        "run_id": run.run_id,
        "summary": run.summary,
        "payload": payload,
    })))
}

async fn download(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = state.run_manager.get_result(&run_id).await?;
    let body = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{run_id}.json\""),
            ),
        ],
        body,
    ))
}

async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.run_manager.cancel(&run_id)?))
}

async fn events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Subscribe before reading the snapshot so no transition is missed.
    let rx = state.run_manager.subscribe();
    let current = state.run_manager.get_status(&run_id)?;

    let manager = state.run_manager.clone();
    let stream = follow_run(current, rx, move |id| manager.get_status(id).ok());

    Ok(build_sse_response(stream))
}
