//! `/health`, `/health/ready`, `/health/live` (§4.K), unauthenticated.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::state::SharedState;

pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<serde_json::Value>) {
    let report = state.health.check().await;
    let status = if report.status == crate::health::ComponentStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::to_value(report).unwrap()))
}

pub async fn ready(State(state): State<SharedState>) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.health.ready().await;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({"ready": ready})))
}

pub async fn live(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"alive": state.health.live()}))
}
