//! Create/start/stop/remove container workers; inspect state; stream logs;
//! resolve container network address.
//!
//! One container per session (§3 Lifecycle). The concrete implementation
//! below drives a container runtime (`podman`/`docker`, per configuration)
//! on a remote host over SSH, the same remote-exec idiom the rest of this
//! service uses for every host-side operation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use shell_escape::escape;

use crate::config::settings;
use crate::ssh;

fn shell_escape(s: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Failed,
}

impl ContainerStatus {
    fn from_runtime_state(state: &str) -> Self {
        match state {
            "running" => Self::Running,
            "created" | "restarting" => Self::Creating,
            "exited" | "removing" | "dead" | "paused" => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

/// Opaque handle to a created container. Carries enough information to
/// address it without a registry lookup (the session id doubles as the
/// container name, so `{tool}.session_id={session_id}` labels always
/// resolve back to one container).
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub session_id: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub addresses: HashMap<String, String>,
}

const LABEL_PREFIX: &str = "agent-gateway.session_id";

/// Tracks handles for containers this process created, so driver
/// operations on a missing handle can log-and-no-op (§4.C) instead of
/// erroring, without needing a runtime round-trip to check existence.
#[derive(Clone)]
pub struct ContainerDriver {
    known: Arc<DashMap<String, ContainerHandle>>,
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerDriver {
    pub fn new() -> Self {
        Self {
            known: Arc::new(DashMap::new()),
        }
    }

    fn container_name(session_id: &str) -> String {
        format!("agent-session-{session_id}")
    }

    /// Create (but do not start) a container for `session_id`.
    pub async fn create(
        &self,
        session_id: &str,
        workspace_path: &str,
        env: &HashMap<String, String>,
        extra_mounts: &[String],
    ) -> Result<ContainerHandle> {
        let s = settings();
        let name = Self::container_name(session_id);

        let mut cmd = format!(
            "{} create --name {} --label {}={} \
             --network {} --cpus {} --memory {} \
             --mount type=bind,source={},target=/workspace",
            shell_escape(&s.container_runtime),
            shell_escape(&name),
            LABEL_PREFIX,
            shell_escape(session_id),
            shell_escape(&s.container_network),
            shell_escape(&s.container_cpu_limit),
            shell_escape(&s.container_memory_limit),
            shell_escape(workspace_path),
        );

        for (k, v) in env {
            cmd.push_str(&format!(" --env {}={}", shell_escape(k), shell_escape(v)));
        }
        for mount in extra_mounts {
            cmd.push_str(&format!(" --mount {}", shell_escape(mount)));
        }
        cmd.push_str(&format!(" {}", shell_escape(&s.container_image)));

        ssh::run_command(&cmd)
            .await
            .map_err(|e| anyhow!("failed to create container for session {session_id}: {e}"))?;

        let handle = ContainerHandle {
            session_id: session_id.to_string(),
            container_name: name,
        };
        self.known.insert(session_id.to_string(), handle.clone());
        tracing::info!(session_id, container = %handle.container_name, "container created");
        Ok(handle)
    }

    pub async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let s = settings();
        let cmd = format!(
            "{} start {}",
            shell_escape(&s.container_runtime),
            shell_escape(&handle.container_name)
        );
        ssh::run_command(&cmd).await?;
        tracing::info!(session_id = %handle.session_id, "container started");
        Ok(())
    }

    /// Poll `status` until `Running` or `timeout` elapses.
    pub async fn wait_for_running(&self, handle: &ContainerHandle, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status(handle).await {
                Ok(ContainerStatus::Running) => return true,
                Ok(ContainerStatus::Failed) => return false,
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        if !self.known.contains_key(&handle.session_id) {
            tracing::debug!(session_id = %handle.session_id, "status: unknown handle, no-op");
            return Ok(ContainerStatus::Stopped);
        }
        let s = settings();
        let cmd = format!(
            "{} inspect --format '{{{{.State.Status}}}}' {}",
            shell_escape(&s.container_runtime),
            shell_escape(&handle.container_name)
        );
        match ssh::run_command(&cmd).await {
            Ok(out) => Ok(ContainerStatus::from_runtime_state(out.trim())),
            Err(_) => Ok(ContainerStatus::Failed),
        }
    }

    pub async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        if !self.known.contains_key(&handle.session_id) {
            tracing::debug!(session_id = %handle.session_id, "stop: unknown handle, no-op");
            return Ok(());
        }
        let s = settings();
        let cmd = format!(
            "{} stop -t {} {}",
            shell_escape(&s.container_runtime),
            grace.as_secs(),
            shell_escape(&handle.container_name)
        );
        ssh::run_command(&cmd).await?;
        tracing::info!(session_id = %handle.session_id, "container stopped");
        Ok(())
    }

    pub async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        if !self.known.contains_key(&handle.session_id) {
            tracing::debug!(session_id = %handle.session_id, "remove: unknown handle, no-op");
            return Ok(());
        }
        let s = settings();
        let cmd = format!(
            "{} rm {} {}",
            shell_escape(&s.container_runtime),
            if force { "-f" } else { "" },
            shell_escape(&handle.container_name)
        );
        ssh::run_command(&cmd).await?;
        self.known.remove(&handle.session_id);
        tracing::info!(session_id = %handle.session_id, "container removed");
        Ok(())
    }

    /// Resolve the container's network addresses, keyed by network name.
    /// Used by the VNC proxy (§4.G) to find the container's port 5900.
    pub async fn inspect(&self, handle: &ContainerHandle) -> Result<NetworkInfo> {
        let s = settings();
        let cmd = format!(
            "{} inspect --format '{{{{range $k,$v := .NetworkSettings.Networks}}}}{{{{$k}}}}={{{{$v.IPAddress}}}} {{{{end}}}}' {}",
            shell_escape(&s.container_runtime),
            shell_escape(&handle.container_name)
        );
        let out = ssh::run_command(&cmd).await?;
        let mut addresses = HashMap::new();
        for pair in out.split_whitespace() {
            if let Some((k, v)) = pair.split_once('=') {
                addresses.insert(k.to_string(), v.to_string());
            }
        }
        Ok(NetworkInfo { addresses })
    }

    pub async fn logs(&self, handle: &ContainerHandle, tail: u32) -> Result<String> {
        let s = settings();
        let cmd = format!(
            "{} logs --tail {} {}",
            shell_escape(&s.container_runtime),
            tail,
            shell_escape(&handle.container_name)
        );
        ssh::run_command(&cmd).await
    }

    /// Rediscover live containers by label, e.g. on startup reconciliation.
    pub async fn list_by_label(&self) -> Result<Vec<String>> {
        let s = settings();
        let cmd = format!(
            "{} ps -a --filter label={} --format '{{{{.Names}}}}'",
            shell_escape(&s.container_runtime),
            LABEL_PREFIX,
        );
        let out = ssh::run_command(&cmd).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Health probe: confirm the remote runtime binary answers at all.
    pub async fn ping(&self) -> Result<()> {
        let s = settings();
        let cmd = format!("{} version --format '{{{{.Server.Os}}}}'", shell_escape(&s.container_runtime));
        ssh::run_command(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_runtime_states() {
        assert_eq!(ContainerStatus::from_runtime_state("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_runtime_state("created"), ContainerStatus::Creating);
        assert_eq!(ContainerStatus::from_runtime_state("exited"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_runtime_state("garbage"), ContainerStatus::Failed);
    }

    #[test]
    fn container_name_is_deterministic_per_session() {
        assert_eq!(
            ContainerDriver::container_name("abc-123"),
            "agent-session-abc-123"
        );
    }

    #[tokio::test]
    async fn unknown_handle_operations_are_noop() {
        let driver = ContainerDriver::new();
        let handle = ContainerHandle {
            session_id: "never-created".to_string(),
            container_name: "agent-session-never-created".to_string(),
        };
        // stop/remove on a handle the driver never created must not error.
        assert!(driver.stop(&handle, Duration::from_secs(1)).await.is_ok());
        assert!(driver.remove(&handle, true).await.is_ok());
    }
}
