//! Create/list/stop/delete sessions; enforce spawn-tree limits; maintain
//! live state in the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::bus::{keys, BusClient};
use common::error::{CoreError, CoreResult};
use serde::Serialize;
use uuid::Uuid;

use crate::config::settings;
use crate::container_driver::ContainerDriver;
use crate::liveness::LivenessState;
use crate::store::session_store::WorkspaceType;
use crate::store::{Session, SessionStatus, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceMode {
    Inherit,
    Clone,
    Ephemeral,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResult {
    pub session_id: String,
    pub status: String,
    pub container_id: Option<String>,
    pub websocket_url: String,
}

#[derive(Clone)]
pub struct SessionService {
    store: SessionStore,
    bus: BusClient,
    containers: ContainerDriver,
    liveness: Arc<LivenessState>,
}

impl SessionService {
    pub fn new(
        store: SessionStore,
        bus: BusClient,
        containers: ContainerDriver,
        liveness: Arc<LivenessState>,
    ) -> Self {
        Self {
            store,
            bus,
            containers,
            liveness,
        }
    }

    /// Cheap pre-check for a would-be child of `parent_id`, so an
    /// over-limit spawn fails fast before a container is ever created.
    /// Not itself race-free — the authoritative, serialized check happens
    /// inside `SessionStore::insert_child_with_limit_check`'s row-locked
    /// transaction (§5) once the container is up and we go to write the row.
    async fn check_spawn_limits(&self, parent_id: &str) -> CoreResult<()> {
        let s = settings();

        let depth = self.store.depth_of(parent_id).await?;
        if depth >= s.max_spawn_depth {
            return Err(CoreError::LimitExceeded(format!(
                "Maximum spawn depth ({}) exceeded",
                s.max_spawn_depth
            )));
        }

        let children = self.store.direct_children_count(parent_id).await?;
        if children >= s.max_children_per_session as i64 {
            return Err(CoreError::LimitExceeded(format!(
                "Maximum children per session ({}) exceeded",
                s.max_children_per_session
            )));
        }

        let tree_total = self.store.tree_total_count(parent_id).await?;
        if tree_total >= s.max_total_instances as i64 {
            return Err(CoreError::LimitExceeded(format!(
                "Maximum total instances ({}) exceeded",
                s.max_total_instances
            )));
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        owner_user_id: &str,
        parent_session_id: Option<&str>,
        workspace_mode: WorkspaceMode,
        workspace_path: &str,
        config: serde_json::Value,
        initial_prompt: Option<&str>,
    ) -> CoreResult<CreateSessionResult> {
        if let Some(parent_id) = parent_session_id {
            // Fast pre-check; the authoritative, row-locked check happens
            // again in `insert_child_with_limit_check` below (§5).
            self.check_spawn_limits(parent_id).await?;
        }

        let s = settings();
        let session_id = Uuid::new_v4().to_string();
        let workspace_type = match workspace_mode {
            WorkspaceMode::Ephemeral => WorkspaceType::Ephemeral,
            WorkspaceMode::Inherit | WorkspaceMode::Clone => WorkspaceType::Persistent,
        };

        // `inherit`/`clone` copy the parent's workspace descriptor (§4.F);
        // `clone` gets a distinct identifier so it forks rather than shares
        // the parent's workspace, `inherit` reuses the parent's id as-is.
        let workspace_id: Option<String> = match (workspace_mode, parent_session_id) {
            (WorkspaceMode::Ephemeral, _) | (WorkspaceMode::Inherit | WorkspaceMode::Clone, None) => None,
            (WorkspaceMode::Inherit, Some(parent_id)) => self.store.get_by_id(parent_id).await?.workspace_id,
            (WorkspaceMode::Clone, Some(parent_id)) => self
                .store
                .get_by_id(parent_id)
                .await?
                .workspace_id
                .map(|_| format!("ws-{}", Uuid::new_v4())),
        };

        let mut env = HashMap::new();
        env.insert("SESSION_ID".to_string(), session_id.clone());
        env.insert("REDIS_URL".to_string(), settings().bus_url.clone());
        env.insert("GATEWAY_URL".to_string(), settings().listen_addr.clone());
        if let Some(parent) = parent_session_id {
            env.insert("PARENT_SESSION_ID".to_string(), parent.to_string());
        }

        // Compensation on any failure from here on: remove the container,
        // delete the row, drop from the active set.
        let result: CoreResult<CreateSessionResult> = async {
            match parent_session_id {
                Some(parent_id) => {
                    self.store
                        .insert_child_with_limit_check(
                            &session_id,
                            parent_id,
                            s.max_spawn_depth,
                            s.max_children_per_session as i64,
                            s.max_total_instances as i64,
                            workspace_type,
                            workspace_id.as_deref(),
                            config,
                            owner_user_id,
                        )
                        .await?;
                }
                None => {
                    self.store
                        .insert(&session_id, None, workspace_type, workspace_id.as_deref(), config, owner_user_id)
                        .await?;
                }
            }

            self.bus
                .hash_set_multiple(
                    &keys::state(&session_id),
                    &[("status", "STARTING"), ("container_id", "")],
                )
                .await?;
            self.bus.expire(&keys::state(&session_id), 60).await?;
            self.bus.set_add(keys::ACTIVE_SESSIONS, &session_id).await?;

            let handle = self
                .containers
                .create(&session_id, workspace_path, &env, &[])
                .await
                .map_err(CoreError::fatal)?;
            self.store.set_container_id(&session_id, &handle.container_name).await?;

            self.containers.start(&handle).await.map_err(CoreError::fatal)?;

            let s = settings();
            let running = self
                .containers
                .wait_for_running(&handle, Duration::from_secs(s.container_startup_timeout_secs))
                .await;
            if !running {
                return Err(CoreError::fatal(anyhow::anyhow!(
                    "container for session {session_id} did not reach RUNNING within {}s",
                    s.container_startup_timeout_secs
                )));
            }

            self.store.update_status(&session_id, SessionStatus::Idle, None).await?;
            self.liveness.register(&session_id);

            if let Some(prompt) = initial_prompt {
                let frame = serde_json::json!({"type": "prompt", "prompt": prompt});
                self.bus
                    .push(&keys::input(&session_id), frame.to_string().as_bytes())
                    .await?;
            }

            metrics::counter!("gateway_sessions_created_total").increment(1);

            Ok(CreateSessionResult {
                session_id: session_id.clone(),
                status: SessionStatus::Idle.as_str().to_string(),
                container_id: Some(handle.container_name),
                websocket_url: format!("/api/v1/sessions/{session_id}/stream"),
            })
        }
        .await;

        if result.is_err() {
            metrics::counter!("gateway_sessions_failed_total").increment(1);
            self.compensate_failed_create(&session_id).await;
        }

        result
    }

    async fn compensate_failed_create(&self, session_id: &str) {
        if let Ok(session) = self.store.get_by_id(session_id).await {
            if let Some(container_name) = session.container_id {
                let handle = crate::container_driver::ContainerHandle {
                    session_id: session_id.to_string(),
                    container_name,
                };
                let _ = self.containers.stop(&handle, Duration::from_secs(5)).await;
                let _ = self.containers.remove(&handle, true).await;
            }
        }
        let _ = self
            .store
            .update_status(session_id, SessionStatus::Failed, Some("create compensation"))
            .await;
        let _ = self.bus.delete(&keys::state(session_id)).await;
        let _ = self.bus.set_remove(keys::ACTIVE_SESSIONS, session_id).await;
        let _ = self.store.delete(session_id).await;
    }

    pub async fn list(
        &self,
        owner: &str,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<(Vec<Session>, i64)> {
        self.store.list(Some(owner), status, limit.min(100), offset).await
    }

    pub async fn get(&self, id: &str) -> CoreResult<(Session, Vec<Session>)> {
        let session = self.store.get_by_id(id).await?;
        let children = self.store.children_of(id).await?;
        Ok((session, children))
    }

    pub async fn stop(&self, id: &str) -> CoreResult<()> {
        let session = self.store.get_by_id(id).await?;
        if session.status == SessionStatus::Stopped.as_str() {
            return Ok(());
        }
        if let Some(container_name) = &session.container_id {
            let handle = crate::container_driver::ContainerHandle {
                session_id: id.to_string(),
                container_name: container_name.clone(),
            };
            self.containers.stop(&handle, Duration::from_secs(10)).await.map_err(CoreError::fatal)?;
        }
        self.store.update_status(id, SessionStatus::Stopped, None).await?;
        self.bus.set_remove(keys::ACTIVE_SESSIONS, id).await?;
        self.liveness.remove(id);
        metrics::counter!("gateway_sessions_stopped_total").increment(1);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let session = self.store.get_by_id(id).await;
        if let Ok(session) = session {
            if let Some(container_name) = &session.container_id {
                let handle = crate::container_driver::ContainerHandle {
                    session_id: id.to_string(),
                    container_name: container_name.clone(),
                };
                let _ = self.containers.stop(&handle, Duration::from_secs(10)).await;
                let _ = self.containers.remove(&handle, true).await;
            }
        }
        self.bus.delete(&keys::state(id)).await?;
        self.bus.delete(&keys::output_buffer(id)).await?;
        self.bus.delete(&keys::result(id)).await?;
        self.bus.set_remove(keys::ACTIVE_SESSIONS, id).await?;
        self.liveness.remove(id);
        self.store.delete(id).await?;
        Ok(())
    }

    /// Publish an interrupt on the pub/sub topic AND append to the backup
    /// queue, so a momentarily-disconnected wrapper still observes it.
    pub async fn interrupt(&self, id: &str, payload: &serde_json::Value) -> CoreResult<()> {
        self.store.get_by_id(id).await?;
        let bytes = payload.to_string();
        self.bus.publish(&keys::interrupt(id), bytes.as_bytes()).await?;
        self.bus.push(&keys::interrupt_queue(id), bytes.as_bytes()).await?;
        Ok(())
    }

    /// Send a prompt. `stream=false` blocks (polling the result key) until
    /// the wrapper publishes a result or `timeout_seconds` elapses.
    pub async fn chat(
        &self,
        id: &str,
        prompt: &str,
        stream: bool,
        timeout_seconds: u64,
    ) -> CoreResult<ChatOutcome> {
        self.store.get_by_id(id).await?;
        let message_id = Uuid::new_v4().to_string();
        let frame = serde_json::json!({"type": "prompt", "prompt": prompt, "message_id": message_id});
        self.bus.push(&keys::input(id), frame.to_string().as_bytes()).await?;

        if !stream {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_seconds);
            loop {
                if let Some(raw) = self.bus.get(&keys::result(id)).await? {
                    if let Ok(result) = serde_json::from_str::<serde_json::Value>(&raw) {
                        let session = self.store.get_by_id(id).await?;
                        return Ok(ChatOutcome::Result {
                            message_id,
                            subtype: result.get("subtype").and_then(|v| v.as_str()).unwrap_or("success").to_string(),
                            result: result.get("result").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                            total_cost_usd: session.total_cost_usd,
                            usage: result.get("usage").cloned().unwrap_or(serde_json::json!({})),
                            duration_ms: result.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
                        });
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(CoreError::Timeout(format!("no result for session {id} within {timeout_seconds}s")));
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        Ok(ChatOutcome::Processing { message_id })
    }

    pub async fn get_message(&self, id: &str, message_id: &str) -> CoreResult<serde_json::Value> {
        self.store.get_by_id(id).await?;
        match self.bus.get(&keys::result(id)).await? {
            Some(raw) => {
                let result: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| CoreError::fatal(anyhow::anyhow!(e)))?;
                Ok(serde_json::json!({"message_id": message_id, "status": "complete", "result": result}))
            }
            None => Ok(serde_json::json!({"message_id": message_id, "status": "processing"})),
        }
    }
}

/// `Processing` is tagged `status` and `Result` is tagged `type`, matching
/// §8 scenario 1's wire shapes exactly rather than unifying under one tag.
#[derive(Debug)]
pub enum ChatOutcome {
    Processing {
        message_id: String,
    },
    Result {
        message_id: String,
        subtype: String,
        result: String,
        total_cost_usd: f64,
        usage: serde_json::Value,
        duration_ms: u64,
    },
}

impl Serialize for ChatOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            ChatOutcome::Processing { message_id } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("message_id", message_id)?;
                map.serialize_entry("status", "processing")?;
                map.end()
            }
            ChatOutcome::Result { message_id, subtype, result, total_cost_usd, usage, duration_ms } => {
                let mut map = serializer.serialize_map(Some(7))?;
                map.serialize_entry("message_id", message_id)?;
                map.serialize_entry("type", "result")?;
                map.serialize_entry("subtype", subtype)?;
                map.serialize_entry("result", result)?;
                map.serialize_entry("total_cost_usd", total_cost_usd)?;
                map.serialize_entry("usage", usage)?;
                map.serialize_entry("duration_ms", duration_ms)?;
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_mode_maps_ephemeral_to_ephemeral_type() {
        assert_eq!(
            match WorkspaceMode::Ephemeral {
                WorkspaceMode::Ephemeral => WorkspaceType::Ephemeral,
                _ => WorkspaceType::Persistent,
            },
            WorkspaceType::Ephemeral
        );
    }
}
