//! Bearer-authenticated axum router binding every component to the routes
//! of §6. Handlers are thin: decode, call a service method, map the typed
//! error kind to an HTTP status (via `CoreError`'s `IntoResponse`), encode.

pub mod auth;
pub mod discord;
pub mod health_routes;
pub mod sessions;
pub mod state;
pub mod tasks;
pub mod ws;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use common::rate_limit::RateLimitLayer;
use metrics_exporter_prometheus::PrometheusHandle;

pub use state::{AppState, SharedState};

pub fn router(state: SharedState, rate_limiter: RateLimitLayer, metrics_handle: PrometheusHandle) -> Router {
    let authenticated = Router::new()
        .route("/api/v1/sessions", post(sessions::create).get(sessions::list))
        .route("/api/v1/sessions/{id}", get(sessions::get).delete(sessions::delete))
        .route("/api/v1/sessions/{id}/stop", post(sessions::stop))
        .route("/api/v1/sessions/{id}/chat", post(sessions::chat))
        .route("/api/v1/sessions/{id}/messages/{mid}", get(sessions::get_message))
        .route("/api/v1/sessions/{id}/spawn", post(sessions::spawn))
        .route("/api/v1/sessions/{id}/children", get(sessions::children))
        .route("/api/v1/sessions/{id}/interrupt", post(sessions::interrupt))
        .route("/api/v1/tasks", post(tasks::create))
        .route("/api/v1/tasks/{id}", get(tasks::get).put(tasks::update).delete(tasks::delete))
        .route("/api/v1/tasks/{id}/start", post(tasks::start))
        .route("/api/v1/tasks/{id}/schedule", post(tasks::schedule))
        .route("/api/v1/tasks/{id}/history", get(tasks::history))
        .route("/api/v1/discord/ask", post(discord::ask))
        .route("/api/v1/discord/notify", post(discord::notify))
        .route_layer(middleware::from_fn(auth::require_bearer));

    // WS routes authenticate themselves inside the handler (token arrives via
    // `?token=`, not a header the upgrade request can reliably carry), so
    // they sit outside the bearer-auth middleware stack.
    let websockets = Router::new()
        .route("/api/v1/sessions/{id}/stream", get(ws::stream))
        .route("/api/v1/sessions/{id}/vnc", get(ws::vnc));

    let unauthenticated = Router::new()
        .route("/health", get(health_routes::health))
        .route("/health/ready", get(health_routes::ready))
        .route("/health/live", get(health_routes::live))
        .route("/metrics", get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }));

    Router::new()
        .merge(authenticated)
        .merge(websockets)
        .merge(unauthenticated)
        .layer(rate_limiter)
        .with_state(state)
}
