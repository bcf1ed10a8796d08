//! Platform-bridge route handlers (§4.J): ask (blocking) and notify
//! (fire-and-forget), exposed for callers that aren't the gateway itself
//! (e.g. a wrapper asking on behalf of its session).

use axum::extract::State;
use axum::Json;
use common::error::CoreResult;
use serde::Deserialize;

use super::state::SharedState;

#[derive(Deserialize)]
pub struct AskRequest {
    session_id: String,
    question: String,
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_attempts")]
    max_attempts: u32,
    #[serde(default = "default_priority")]
    priority: String,
}

fn default_timeout() -> u64 {
    60
}
fn default_attempts() -> u32 {
    1
}
fn default_priority() -> String {
    "normal".to_string()
}

pub async fn ask(State(state): State<SharedState>, Json(req): Json<AskRequest>) -> CoreResult<Json<serde_json::Value>> {
    let outcome = state
        .platform
        .ask(&req.session_id, &req.question, req.timeout_seconds, req.max_attempts, &req.priority)
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap()))
}

#[derive(Deserialize)]
pub struct NotifyRequest {
    session_id: String,
    message: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    summary: Option<String>,
}

pub async fn notify(State(state): State<SharedState>, Json(req): Json<NotifyRequest>) -> CoreResult<axum::http::StatusCode> {
    state
        .platform
        .notify(&req.session_id, &req.message, &req.priority, req.summary.as_deref())
        .await?;
    Ok(axum::http::StatusCode::OK)
}
