//! The per-session state machine: IDLE blocks on the input queue (1 s
//! timeout, to stay responsive to shutdown); on a prompt it transitions to
//! RUNNING, spawns the agent subprocess, streams its stdout through the
//! shared [`common::stream_parser::StreamParser`], and publishes a
//! formatted frame per event. On subprocess exit it publishes a terminal
//! result and returns to IDLE (§4.D).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use common::bus::{keys, BusClient};
use common::stream_parser::StreamParser;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::stream_json::format_tool_action;

/// SIGTERM, then up to `grace_secs`, then SIGKILL (§4.D cancellation path).
async fn terminate_gracefully(child: &mut tokio::process::Child, pid: Option<u32>, grace_secs: u64) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
    let graceful = tokio::time::timeout(std::time::Duration::from_secs(grace_secs), child.wait()).await;
    if graceful.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

pub struct InteractiveLoop {
    bus: BusClient,
    settings: Settings,
    claude_session_id: Option<String>,
    turn_count: u64,
}

impl InteractiveLoop {
    pub fn new(bus: BusClient, settings: Settings) -> Self {
        Self { bus, settings, claude_session_id: None, turn_count: 0 }
    }

    pub async fn run(&mut self, cancel: CancellationToken) {
        self.update_state("idle").await;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let input_queue = keys::input(&self.settings.session_id);
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.bus.blocking_pop(&input_queue, std::time::Duration::from_secs(self.settings.idle_poll_secs)) => result,
            };

            let frame = match popped {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to pop input queue");
                    continue;
                }
            };

            let Ok(parsed) = serde_json::from_slice::<Value>(&frame) else {
                tracing::warn!("dropped malformed input frame");
                continue;
            };
            if parsed.get("type").and_then(|t| t.as_str()) != Some("prompt") {
                continue;
            }
            let Some(prompt) = parsed.get("prompt").and_then(|p| p.as_str()) else {
                continue;
            };
            let message_id = parsed.get("message_id").and_then(|m| m.as_str()).map(str::to_string);

            self.update_state("running").await;
            self.run_turn(prompt, message_id, &cancel).await;
            self.turn_count += 1;
            self.update_state("idle").await;
        }

        self.update_state("stopped").await;
        tracing::info!(turns = self.turn_count, "interactive loop ended");
    }

    async fn update_state(&self, status: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        let key = keys::state(&self.settings.session_id);
        let _ = self
            .bus
            .hash_set_multiple(&key, &[("status", status), ("last_heartbeat", &now)])
            .await;
        let _ = self.bus.expire(&key, self.settings.state_ttl_secs).await;
    }

    async fn run_turn(&mut self, prompt: &str, message_id: Option<String>, cancel: &CancellationToken) {
        let start = Instant::now();
        let s = &self.settings;

        let mut args = vec!["-p".to_string(), prompt.to_string(), "--output-format".to_string(), "stream-json".to_string(), "--verbose".to_string()];
        if let Some(resume_id) = &self.claude_session_id {
            args.push("--resume".to_string());
            args.push(resume_id.clone());
        }

        tracing::info!(turn = self.turn_count + 1, has_resume = self.claude_session_id.is_some(), "spawning agent subprocess");

        let child = Command::new(&s.agent_command)
            .args(&args)
            .current_dir(&s.workspace_path)
            .env("CLAUDE_CODE_ENTRYPOINT", "cc-docker")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn agent subprocess");
                self.publish_error(&format!("failed to spawn agent: {e}")).await;
                self.publish_terminal_result(None, "error", serde_json::json!({}), start, message_id).await;
                return;
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stderr_drain = tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => tracing::warn!(stderr = %line.trim_end(), "agent stderr"),
                }
            }
        });

        let pid = child.id();
        let (result, usage, cancelled) = self.stream_stdout(stdout, cancel).await;
        let _ = stderr_drain.await;

        if cancelled {
            terminate_gracefully(&mut child, pid, self.settings.stop_grace_secs).await;
        }

        let exit_status = child.wait().await.ok();
        let exit_ok = !cancelled && exit_status.map(|s| s.success()).unwrap_or(false);

        let subtype = if exit_ok { "success" } else { "error" };
        self.publish_terminal_result(result, subtype, usage, start, message_id).await;
    }

    /// Reads stdout in raw chunks (not line-buffered — the agent's
    /// stream-json objects can themselves contain embedded newlines) and
    /// feeds each chunk to the shared brace-counting parser. Returns
    /// `(result, usage, was_cancelled)`.
    async fn stream_stdout(
        &mut self,
        mut stdout: tokio::process::ChildStdout,
        cancel: &CancellationToken,
    ) -> (Option<String>, Value, bool) {
        let mut parser = StreamParser::new();
        let mut buf = vec![0u8; 4096];
        let mut result = None;
        let mut usage = serde_json::json!({});
        let cancelled = AtomicBool::new(false);

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled.store(true, Ordering::Relaxed);
                    break;
                }
                n = stdout.read(&mut buf) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };

            let chunk = String::from_utf8_lossy(&buf[..n]);
            for message in parser.feed(&chunk) {
                self.handle_message(&message, &mut result, &mut usage).await;
            }
        }

        (result, usage, cancelled.load(Ordering::Relaxed))
    }

    async fn handle_message(&mut self, message: &Value, result: &mut Option<String>, usage: &mut Value) {
        let msg_type = message.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");

        match msg_type {
            "system" => {
                if message.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                    if let Some(sid) = message.get("session_id").and_then(|s| s.as_str()) {
                        self.claude_session_id = Some(sid.to_string());
                    }
                }
            }
            "assistant" => {
                self.publish_assistant_content(message).await;
            }
            "result" => {
                *result = message.get("result").and_then(|r| r.as_str()).map(str::to_string);
                if let Some(raw) = message.get("usage") {
                    *usage = raw.clone();
                }
                if let Some(sid) = message.get("session_id").and_then(|s| s.as_str()) {
                    self.claude_session_id = Some(sid.to_string());
                }
                // Result is published separately as the terminal frame, not
                // forwarded as a plain output event.
            }
            _ => {
                self.publish_output(message).await;
            }
        }
    }

    async fn publish_assistant_content(&self, message: &Value) {
        let Some(content) = message.pointer("/message/content").and_then(|c| c.as_array()) else {
            return;
        };
        for part in content {
            match part.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        self.publish_output(&serde_json::json!({"type": "text", "text": text})).await;
                    }
                }
                Some("tool_use") => {
                    let name = part.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
                    let input = part.get("input").cloned().unwrap_or(serde_json::json!({}));
                    let action = format_tool_action(name, &input);
                    self.publish_output(&serde_json::json!({"type": "tool_use", "tool": name, "action": action, "input": input})).await;
                }
                _ => {}
            }
        }
    }

    async fn publish_output(&self, data: &Value) {
        let payload = serde_json::json!({
            "type": "output",
            "session_id": self.settings.session_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": data,
        });
        let topic = keys::output(&self.settings.session_id);
        let _ = self.bus.publish(&topic, payload.to_string().as_bytes()).await;
        let _ = self.bus.list_push_trim(&keys::output_buffer(&self.settings.session_id), payload.to_string().as_bytes(), 1000).await;
        let _ = self.bus.expire(&keys::output_buffer(&self.settings.session_id), 3600).await;
    }

    async fn publish_error(&self, error: &str) {
        let payload = serde_json::json!({
            "type": "error",
            "session_id": self.settings.session_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": {"error": error},
        });
        let _ = self.bus.publish(&keys::output(&self.settings.session_id), payload.to_string().as_bytes()).await;
    }

    async fn publish_terminal_result(
        &self,
        result: Option<String>,
        subtype: &str,
        usage: Value,
        start: Instant,
        message_id: Option<String>,
    ) {
        let duration_ms = start.elapsed().as_millis() as u64;
        let result = result.unwrap_or_default();

        let output_payload = serde_json::json!({
            "type": "result",
            "session_id": self.settings.session_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": {
                "message_id": message_id,
                "subtype": subtype,
                "result": result,
                "usage": usage,
                "duration_ms": duration_ms,
            },
        });
        let _ = self.bus.publish(&keys::output(&self.settings.session_id), output_payload.to_string().as_bytes()).await;

        let result_payload = serde_json::json!({
            "subtype": subtype,
            "result": result,
            "usage": usage,
            "duration_ms": duration_ms,
        });
        let result_key = keys::result(&self.settings.session_id);
        let _ = self
            .bus
            .set_with_ttl(&result_key, &result_payload.to_string(), std::time::Duration::from_secs(self.settings.result_ttl_secs as u64))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_gracefully_reaps_a_cooperative_process() {
        let mut child = Command::new("sleep").arg("30").stdout(Stdio::null()).kill_on_drop(true).spawn().unwrap();
        let pid = child.id();
        terminate_gracefully(&mut child, pid, 5).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_gracefully_force_kills_a_signal_ignoring_process() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id();
        terminate_gracefully(&mut child, pid, 1).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
