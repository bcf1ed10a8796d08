//! Session route handlers: thin decode/call/encode over SessionService.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use common::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

use super::state::SharedState;
use crate::session_service::{ChatOutcome, WorkspaceMode};

fn owner_header(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-owner-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    parent_session_id: Option<String>,
    #[serde(default)]
    workspace_mode: Option<String>,
    #[serde(default = "default_workspace_path")]
    workspace_path: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    initial_prompt: Option<String>,
}

fn default_workspace_path() -> String {
    "/workspace".to_string()
}

fn parse_workspace_mode(s: Option<&str>) -> WorkspaceMode {
    match s {
        Some("clone") => WorkspaceMode::Clone,
        Some("ephemeral") => WorkspaceMode::Ephemeral,
        _ => WorkspaceMode::Inherit,
    }
}

pub async fn create(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> CoreResult<(StatusCode, Json<serde_json::Value>)> {
    let owner = owner_header(&headers);
    let result = state
        .sessions
        .create(
            &owner,
            req.parent_session_id.as_deref(),
            parse_workspace_mode(req.workspace_mode.as_deref()),
            &req.workspace_path,
            req.config,
            req.initial_prompt.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(result).unwrap())))
}

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    20
}

pub async fn list(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Query(q): Query<ListQuery>,
) -> CoreResult<Json<serde_json::Value>> {
    let owner = owner_header(&headers);
    let (sessions, total) = state
        .sessions
        .list(&owner, q.status.as_deref(), q.limit.min(100), q.offset.max(0))
        .await?;
    Ok(Json(serde_json::json!({"sessions": sessions, "total": total})))
}

pub async fn get(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<Json<serde_json::Value>> {
    let (session, children) = state.sessions.get(&id).await?;
    Ok(Json(serde_json::json!({"session": session, "children": children})))
}

pub async fn stop(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<StatusCode> {
    state.sessions.stop(&id).await?;
    Ok(StatusCode::OK)
}

pub async fn delete(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<StatusCode> {
    state.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ChatRequest {
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(default = "default_chat_timeout")]
    timeout_seconds: u64,
}

fn default_chat_timeout() -> u64 {
    crate::config::settings().chat_blocking_timeout_secs
}

pub async fn chat(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> CoreResult<Json<ChatOutcome>> {
    let outcome = state.sessions.chat(&id, &req.prompt, req.stream, req.timeout_seconds).await?;
    Ok(Json(outcome))
}

pub async fn get_message(
    State(state): State<SharedState>,
    Path((id, message_id)): Path<(String, String)>,
) -> CoreResult<Json<serde_json::Value>> {
    Ok(Json(state.sessions.get_message(&id, &message_id).await?))
}

#[derive(Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    workspace_mode: Option<String>,
    #[serde(default = "default_workspace_path")]
    workspace_path: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    initial_prompt: Option<String>,
}

pub async fn spawn(
    State(state): State<SharedState>,
    Path(parent_id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(req): Json<SpawnRequest>,
) -> CoreResult<(StatusCode, Json<serde_json::Value>)> {
    let owner = owner_header(&headers);
    let result = state
        .sessions
        .create(
            &owner,
            Some(&parent_id),
            parse_workspace_mode(req.workspace_mode.as_deref()),
            &req.workspace_path,
            req.config,
            req.initial_prompt.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(result).unwrap())))
}

pub async fn children(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<Json<serde_json::Value>> {
    let (_, children) = state.sessions.get(&id).await?;
    Ok(Json(serde_json::json!({"children": children})))
}

#[derive(Deserialize, Serialize)]
pub struct InterruptRequest {
    #[serde(rename = "type")]
    kind: String,
    message: String,
    #[serde(default = "default_priority")]
    priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

pub async fn interrupt(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<InterruptRequest>,
) -> CoreResult<StatusCode> {
    let payload = serde_json::to_value(&req).map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
    state.sessions.interrupt(&id, &payload).await?;
    Ok(StatusCode::OK)
}
