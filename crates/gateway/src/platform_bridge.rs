//! Issues ask/notify requests externally and awaits responses via the bus
//! with retries.

use std::time::Duration;

use chat_client::Mattermost;
use common::bus::{keys, BusClient};
use common::error::CoreResult;
use uuid::Uuid;

use crate::config::settings;
use crate::store::ask_store::AskType;
use crate::store::AskStore;

#[derive(Clone)]
pub struct PlatformBridge {
    chat: Option<Mattermost>,
    bus: BusClient,
    asks: AskStore,
}

#[derive(Debug, serde::Serialize)]
pub struct AskOutcome {
    pub status: String,
    pub response: Option<String>,
    pub timed_out: bool,
}

impl PlatformBridge {
    pub fn new(chat: Option<Mattermost>, bus: BusClient, asks: AskStore) -> Self {
        Self { chat, bus, asks }
    }

    /// Fire-and-forget: post externally, persist an interaction row with
    /// status `completed`.
    pub async fn notify(
        &self,
        session_id: &str,
        message: &str,
        priority: &str,
        summary: Option<&str>,
    ) -> CoreResult<()> {
        let id = Uuid::new_v4().to_string();
        self.asks
            .create_pending(&id, session_id, AskType::Notification, 1, 0, priority)
            .await?;

        if let Some(chat) = &self.chat {
            let s = settings();
            if let Some(channel_id) = &s.chat_platform_channel_id {
                let body = summary.map(|s| format!("{s}\n\n{message}")).unwrap_or_else(|| message.to_string());
                let _ = chat.post(channel_id, &body).await;
            }
        }

        self.asks.mark_completed(&id).await?;
        metrics::counter!("gateway_notify_total").increment(1);
        Ok(())
    }

    /// Blocking ask: persist pending, post (new thread on attempt 1, a
    /// retry message thereafter), then poll the bus response key every
    /// second until answered or `timeout_seconds` elapses, up to
    /// `max_attempts` times.
    pub async fn ask(
        &self,
        session_id: &str,
        question: &str,
        timeout_seconds: u64,
        max_attempts: u32,
        priority: &str,
    ) -> CoreResult<AskOutcome> {
        let id = Uuid::new_v4().to_string();
        self.asks
            .create_pending(&id, session_id, AskType::Question, max_attempts as i32, timeout_seconds as i32, priority)
            .await?;

        let response_key = keys::discord_response(session_id, &id);
        let s = settings();
        let poll_interval = Duration::from_secs(s.ask_poll_interval_secs);

        let mut thread_id: Option<String> = None;

        for attempt in 1..=max_attempts {
            self.asks.record_attempt(&id, attempt as i32, thread_id.as_deref()).await?;

            if let Some(chat) = &self.chat {
                if let Some(channel_id) = &s.chat_platform_channel_id {
                    let post_result = match &thread_id {
                        None => chat.post(channel_id, question).await,
                        Some(root) => {
                            chat.post_in_thread(channel_id, root, &format!("(retry {attempt}) {question}")).await
                        }
                    };
                    if let Ok(post_id) = post_result {
                        if thread_id.is_none() {
                            thread_id = Some(post_id);
                        }
                    }
                }
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_seconds);
            loop {
                if let Ok(Some(response)) = self.bus.get(&response_key).await {
                    self.asks.mark_answered(&id, &response).await?;
                    self.bus.delete(&response_key).await.ok();
                    metrics::counter!("gateway_ask_answered_total").increment(1);
                    return Ok(AskOutcome {
                        status: "answered".to_string(),
                        response: Some(response),
                        timed_out: false,
                    });
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        }

        self.asks.mark_timeout(&id).await?;
        metrics::counter!("gateway_ask_timeout_total").increment(1);
        Ok(AskOutcome {
            status: "timeout".to_string(),
            response: None,
            timed_out: true,
        })
    }

    pub async fn ping_chat(&self) -> bool {
        self.chat.is_some()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn ask_outcome_timed_out_has_no_response() {
        use super::AskOutcome;
        let outcome = AskOutcome {
            status: "timeout".to_string(),
            response: None,
            timed_out: true,
        };
        assert!(outcome.timed_out);
        assert!(outcome.response.is_none());
    }
}
