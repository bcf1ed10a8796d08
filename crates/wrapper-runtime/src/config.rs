//! Configuration for the per-container wrapper process. Populated from the
//! env vars the gateway's `ContainerDriver::create` sets on every worker
//! container (§4.F step 2), plus a handful of wrapper-local tunables.

use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub session_id: String,
    pub redis_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,

    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: i64,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: i64,
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_gateway_url() -> String {
    "http://gateway:8000".into()
}
fn default_workspace_path() -> String {
    "/workspace".into()
}
fn default_agent_command() -> String {
    "claude".into()
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_state_ttl_secs() -> i64 {
    60
}
fn default_result_ttl_secs() -> i64 {
    3600
}
fn default_idle_poll_secs() -> u64 {
    1
}
fn default_stop_grace_secs() -> u64 {
    5
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Load settings once from unprefixed environment variables (`SESSION_ID`,
/// `REDIS_URL`, ...) — these names are fixed by what the container is
/// started with, not a wrapper-chosen convention.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .expect("failed to build wrapper configuration")
            .try_deserialize()
            .expect("failed to deserialize wrapper configuration: SESSION_ID and REDIS_URL are required")
    })
}

#[cfg(test)]
pub fn init_for_test(overrides: &[(&str, &str)]) -> &'static Settings {
    SETTINGS.get_or_init(|| {
        let mut builder = config::Config::builder()
            .set_default("session_id", "test-session")
            .unwrap()
            .set_default("redis_url", "redis://localhost")
            .unwrap();
        for (k, v) in overrides {
            builder = builder.set_override(*k, *v).unwrap();
        }
        builder.build().unwrap().try_deserialize().unwrap()
    })
}
