//! WS route handlers: handshake + auth, then hand off to StreamBridge.

use axum::extract::ws::{CloseFrame, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::response::Response;
use serde::Deserialize;

use super::auth::{token_from_protocol_header, token_is_valid};
use super::state::SharedState;
use crate::stream_bridge;

const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_NOT_FOUND: u16 = 4004;

#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn stream(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<WsAuthQuery>,
    State(state): State<SharedState>,
    req: Request,
) -> Response {
    let token = query.token.or_else(|| token_from_protocol_header(&req));
    if !token_is_valid(token.as_deref()) {
        return close_with_code(ws, CLOSE_UNAUTHORIZED, "unauthorized");
    }
    if state.sessions.get(&session_id).await.is_err() {
        return close_with_code(ws, CLOSE_NOT_FOUND, "session not found");
    }

    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| stream_bridge::run_agent_stream(socket, session_id, bus))
}

pub async fn vnc(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<WsAuthQuery>,
    State(state): State<SharedState>,
    req: Request,
) -> Response {
    let token = query.token.or_else(|| token_from_protocol_header(&req));
    if !token_is_valid(token.as_deref()) {
        return close_with_code(ws, CLOSE_UNAUTHORIZED, "unauthorized");
    }
    if state.sessions.get(&session_id).await.is_err() {
        return close_with_code(ws, CLOSE_NOT_FOUND, "session not found");
    }

    let store = state.session_store.clone();
    let containers = state.containers.clone();
    ws.on_upgrade(move |socket| stream_bridge::run_vnc_proxy(socket, session_id, store, containers))
}

fn close_with_code(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        use axum::extract::ws::Message;
        use futures_util::SinkExt;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}
