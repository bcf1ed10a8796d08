//! Bidirectional relay: external WS <-> session's output topic + input
//! queue; also TCP<->WS binary proxy for VNC.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use common::bus::{keys, BusClient};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::container_driver::{ContainerDriver, ContainerHandle};
use crate::store::SessionStore;

/// Run the agent-stream bridge for an already-authenticated, already
/// session-verified WS connection. Returns when either direction ends.
pub async fn run_agent_stream(socket: WebSocket, session_id: String, bus: BusClient) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let output_topic = keys::output(&session_id);
    let input_queue = keys::input(&session_id);

    let mut subscription = match bus.subscribe(&output_topic).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "failed to subscribe to output topic");
            let _ = ws_tx
                .send(Message::Text(r#"{"type":"error","message":"bus unavailable"}"#.into()))
                .await;
            return;
        }
    };

    // Both directions feed a single writer task through this channel: the
    // bus subscription forwards worker output, client_to_worker pushes a
    // "pong" reply for every "ping" frame it sees.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let writer = async {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    let worker_to_client = async {
        while let Some(payload) = subscription.next().await {
            let text = String::from_utf8_lossy(&payload).to_string();
            if tx.send(text).is_err() {
                break;
            }
        }
    };

    let client_to_worker = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
            match frame.get("type").and_then(|t| t.as_str()) {
                Some("ping") => {
                    if tx.send(r#"{"type":"pong"}"#.to_string()).is_err() {
                        break;
                    }
                }
                Some("prompt") => {
                    if let Some(prompt) = frame.get("prompt").and_then(|p| p.as_str()) {
                        let input_frame = serde_json::json!({"type": "prompt", "prompt": prompt});
                        let _ = bus.push(&input_queue, input_frame.to_string().as_bytes()).await;
                    }
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = worker_to_client => {}
        _ = client_to_worker => {}
    }
}

/// VNC binary proxy: WS <-> TCP to the container's port 5900.
pub async fn run_vnc_proxy(
    socket: WebSocket,
    session_id: String,
    store: SessionStore,
    containers: ContainerDriver,
) {
    let session = match store.get_by_id(&session_id).await {
        Ok(s) => s,
        Err(_) => return,
    };
    let Some(container_name) = session.container_id else {
        return;
    };

    let handle = ContainerHandle {
        session_id: session_id.clone(),
        container_name,
    };

    let network = match containers.inspect(&handle).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "vnc proxy: inspect failed");
            return;
        }
    };
    let Some(address) = network.addresses.values().next() else {
        tracing::warn!(session_id = %session_id, "vnc proxy: no container network address");
        return;
    };

    let addr: SocketAddr = match format!("{address}:5900").parse() {
        Ok(a) => a,
        Err(_) => return,
    };
    let tcp = match TcpStream::connect(addr).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "vnc proxy: tcp connect failed");
            return;
        }
    };

    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let ws_to_tcp = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Binary(data) = msg {
                if tcp_write.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    };

    let tcp_to_ws = async {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = ws_to_tcp => {}
        _ = tcp_to_ws => {}
    }
}
