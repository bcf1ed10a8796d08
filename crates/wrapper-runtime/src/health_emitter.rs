//! Every `heartbeat_interval_secs`, refreshes `session:{id}:state`'s
//! `last_heartbeat` field and the key's TTL. A heartbeat silence beyond the
//! TTL is the supervisor's definition of a dead worker (§4.D).

use common::bus::{keys, BusClient};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

pub async fn run(bus: BusClient, settings: &Settings, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(settings.heartbeat_interval_secs));
    let state_key = keys::state(&settings.session_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("health emitter shutting down");
                return;
            }
            _ = tick.tick() => {
                let now = chrono::Utc::now().to_rfc3339();
                if let Err(e) = bus.hash_set(&state_key, "last_heartbeat", &now).await {
                    tracing::warn!(error = %e, "failed to write heartbeat");
                    continue;
                }
                if let Err(e) = bus.expire(&state_key, settings.state_ttl_secs).await {
                    tracing::warn!(error = %e, "failed to refresh state TTL");
                }
            }
        }
    }
}
