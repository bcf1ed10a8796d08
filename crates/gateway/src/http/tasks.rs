//! Task route handlers: thin decode/call/encode over TaskService + Scheduler.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use common::error::CoreResult;
use serde::Deserialize;

use super::state::SharedState;

fn owner_header(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-owner-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    task_name: String,
    template_prompt: String,
    #[serde(default)]
    required_parameters: Vec<String>,
    #[serde(default)]
    optional_parameters: serde_json::Value,
    #[serde(default)]
    schedule_cron: Option<String>,
    #[serde(default)]
    schedule_timezone: Option<String>,
}

pub async fn create(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> CoreResult<(StatusCode, Json<serde_json::Value>)> {
    let owner = owner_header(&headers);
    let task = state
        .tasks
        .create(
            &req.task_name,
            &req.template_prompt,
            &req.required_parameters,
            req.optional_parameters,
            req.schedule_cron.as_deref(),
            req.schedule_timezone.as_deref(),
            &owner,
        )
        .await?;

    if let Some(cron_expr) = &req.schedule_cron {
        state
            .scheduler
            .add_task_schedule(&task.id, cron_expr, req.schedule_timezone.as_deref(), "api", Some(&owner))
            .await?;
    }

    Ok((StatusCode::CREATED, Json(serde_json::to_value(task).unwrap())))
}

pub async fn get(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<Json<serde_json::Value>> {
    let task = state.tasks.get(&id).await?;
    Ok(Json(serde_json::to_value(task).unwrap()))
}

#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    template_prompt: Option<String>,
    #[serde(default)]
    required_parameters: Option<Vec<String>>,
    #[serde(default)]
    optional_parameters: Option<serde_json::Value>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    notify_on_complete: Option<bool>,
    #[serde(default)]
    notify_on_error: Option<bool>,
}

pub async fn update(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let task = state
        .tasks
        .update(
            &id,
            req.template_prompt.as_deref(),
            req.required_parameters.as_deref(),
            req.optional_parameters,
            req.enabled,
            req.notify_on_complete,
            req.notify_on_error,
        )
        .await?;
    Ok(Json(serde_json::to_value(task).unwrap()))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    hard: bool,
}

pub async fn delete(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    axum::extract::Query(q): axum::extract::Query<DeleteQuery>,
) -> CoreResult<StatusCode> {
    state.tasks.delete(&id, q.hard).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct StartTaskRequest {
    #[serde(default)]
    parameters: serde_json::Value,
}

pub async fn start(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let (run, filled_prompt) = state.tasks.start(&id, req.parameters, "manual").await?;

    if run.status != crate::store::TaskRunStatus::WaitingDependency.as_str() {
        let task = state.tasks.get(&id).await?;
        let created = state
            .sessions
            .create(
                &task.owner_user_id,
                None,
                crate::session_service::WorkspaceMode::Ephemeral,
                "/workspace",
                serde_json::json!({}),
                Some(&filled_prompt),
            )
            .await;
        match created {
            Ok(session) => {
                state
                    .tasks
                    .update_run(&run.id, crate::store::TaskRunStatus::Running, Some(&session.session_id), None, None)
                    .await?;
                state.tasks.track_run_completion(run.id.clone(), session.session_id.clone());
            }
            Err(e) => {
                state
                    .tasks
                    .update_run(&run.id, crate::store::TaskRunStatus::Failed, None, None, Some(&e.to_string()))
                    .await?;
            }
        }
    }

    Ok(Json(serde_json::to_value(run).unwrap()))
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    cron: String,
    #[serde(default)]
    timezone: Option<String>,
}

pub async fn schedule(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(req): Json<ScheduleRequest>,
) -> CoreResult<StatusCode> {
    let owner = owner_header(&headers);
    state
        .scheduler
        .add_task_schedule(&id, &req.cron, req.timezone.as_deref(), "api", Some(&owner))
        .await?;
    Ok(StatusCode::OK)
}

pub async fn history(State(state): State<SharedState>, Path(id): Path<String>) -> CoreResult<Json<serde_json::Value>> {
    let runs = state.tasks.list_runs(&id, 50).await?;
    Ok(Json(serde_json::json!({"runs": runs})))
}
