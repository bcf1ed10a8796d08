//! Periodic advisory sweep over session idle time.
//!
//! Session idle (300 s default) is advisory, not enforced: a session left
//! IDLE past the threshold is logged and counted, but only an explicit
//! `stop`/`delete` call transitions it — the gateway is the sole writer of
//! session status transitions except heartbeat, and idle alone is not a
//! status change.

use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::settings;
use crate::liveness::LivenessState;
use crate::store::{SessionStatus, SessionStore};

pub async fn spawn_idle_monitor(
    store: SessionStore,
    liveness: std::sync::Arc<LivenessState>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let s = settings();
        if s.idle_monitor_interval_secs == 0 {
            return;
        }
        let mut tick = interval(Duration::from_secs(s.idle_monitor_interval_secs));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("idle monitor shutting down");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = sweep(&store, &liveness).await {
                        tracing::error!(error = %e, "idle monitor sweep failed");
                    }
                }
            }
        }
    })
}

async fn sweep(store: &SessionStore, liveness: &LivenessState) -> anyhow::Result<()> {
    let s = settings();
    let threshold = Duration::from_secs(s.session_idle_timeout_secs);

    let (sessions, _total) = store
        .list(None, Some(SessionStatus::Idle.as_str()), 500, 0)
        .await?;

    for session in sessions {
        let Some(info) = liveness.get_info(&session.id) else {
            continue;
        };
        if info.idle_duration >= threshold {
            metrics::counter!("gateway_sessions_idle_advisory_total").increment(1);
            tracing::info!(
                session_id = %session.id,
                idle_secs = info.idle_duration.as_secs(),
                "session idle past advisory threshold"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_comparison_is_inclusive_at_boundary() {
        let threshold = Duration::from_secs(300);
        let idle = Duration::from_secs(300);
        assert!(idle >= threshold);
        let idle_under = Duration::from_secs(299);
        assert!(idle_under < threshold);
    }
}
