//! Subscribes to the interrupt topic and drains the interrupt backup queue
//! on startup, so an interrupt sent before the wrapper subscribed is not
//! lost (§4.D). Dispatches by `type`: `stop` cancels the session; `redirect`
//! injects a high-priority prompt at the head of the input queue; `pause`
//! is reserved and currently a no-op.

use common::bus::{keys, BusClient};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

pub async fn run(bus: BusClient, settings: &Settings, cancel: CancellationToken) {
    drain_backup_queue(&bus, settings).await;

    let topic = keys::interrupt(&settings.session_id);
    let mut subscription = match bus.subscribe(&topic).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "interrupt listener failed to subscribe, interrupts will only arrive via backup queue");
            cancel.cancelled().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("interrupt listener shutting down");
                return;
            }
            payload = subscription.next() => {
                match payload {
                    Some(bytes) => dispatch(&bus, settings, &bytes, &cancel).await,
                    None => {
                        tracing::warn!("interrupt subscription dropped");
                        return;
                    }
                }
            }
        }
    }
}

async fn drain_backup_queue(bus: &BusClient, settings: &Settings) {
    let queue = keys::interrupt_queue(&settings.session_id);
    // Whatever is queued is already sitting there; a short poll timeout
    // (rather than BLPOP's block-forever-on-zero semantics) is enough to
    // drain it without risking a startup hang on an empty queue.
    loop {
        match bus.blocking_pop(&queue, std::time::Duration::from_millis(50)).await {
            Ok(Some(bytes)) => dispatch(bus, settings, &bytes, &CancellationToken::new()).await,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to drain interrupt backup queue");
                return;
            }
        }
    }
}

async fn dispatch(bus: &BusClient, settings: &Settings, payload: &[u8], cancel: &CancellationToken) {
    let Ok(frame) = serde_json::from_slice::<serde_json::Value>(payload) else {
        tracing::warn!("dropped malformed interrupt frame");
        return;
    };

    match frame.get("type").and_then(|t| t.as_str()) {
        Some("stop") => {
            tracing::info!("interrupt: stop");
            cancel.cancel();
        }
        Some("redirect") => {
            let message = frame.get("message").and_then(|m| m.as_str()).unwrap_or_default();
            let priority = frame.get("priority").and_then(|p| p.as_str()).unwrap_or("normal");
            let banner = redirect_banner(priority, message);
            let prompt_frame = serde_json::json!({"type": "prompt", "prompt": banner});
            if let Err(e) = bus.push_front(&keys::input(&settings.session_id), prompt_frame.to_string().as_bytes()).await {
                tracing::warn!(error = %e, "failed to inject redirect prompt");
            }
        }
        Some("pause") => {
            tracing::info!("interrupt: pause (reserved, no-op)");
        }
        other => {
            tracing::warn!(kind = ?other, "unknown interrupt type");
        }
    }
}

fn redirect_banner(priority: &str, message: &str) -> String {
    format!("[INTERRUPT FROM PARENT - {}]\n\n{}", priority.to_uppercase(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_banner_uppercases_priority_and_leads_with_blank_line() {
        let banner = redirect_banner("high", "switch to file B");
        assert_eq!(banner, "[INTERRUPT FROM PARENT - HIGH]\n\nswitch to file B");
    }
}
