use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// PostgreSQL connection URL.
    pub database_url: String,
    #[serde(default = "default_database_pool_size")]
    pub database_pool_size: u32,

    /// Bus (Redis) connection URL.
    pub bus_url: String,

    /// Object store endpoint + credentials for workspace snapshots.
    #[serde(default)]
    pub object_store_url: Option<String>,
    #[serde(default)]
    pub object_store_access_key: Option<String>,
    #[serde(default)]
    pub object_store_secret_key: Option<String>,
    #[serde(default = "default_object_store_bucket")]
    pub object_store_bucket: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Shared secret used to verify bearer tokens.
    pub bearer_secret: String,
    #[serde(default = "default_bearer_algorithm")]
    pub bearer_algorithm: String,

    /// SSH command timeout, for container driver operations against the
    /// remote container host.
    #[serde(default = "default_ssh_timeout_secs")]
    pub ssh_timeout_secs: u64,
    pub vm_host: String,
    #[serde(default = "default_vm_user")]
    pub vm_user: String,
    #[serde(default)]
    pub vm_ssh_key: Option<String>,
    #[serde(default = "default_ssh_key_path")]
    pub vm_ssh_key_path: String,

    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default = "default_container_image")]
    pub container_image: String,
    #[serde(default = "default_container_network")]
    pub container_network: String,
    #[serde(default = "default_container_cpu_limit")]
    pub container_cpu_limit: String,
    #[serde(default = "default_container_memory_limit")]
    pub container_memory_limit: String,

    #[serde(default = "default_container_startup_timeout_secs")]
    pub container_startup_timeout_secs: u64,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_chat_blocking_timeout_secs")]
    pub chat_blocking_timeout_secs: u64,
    /// How long a task run is tracked for its spawned session's terminal
    /// result before being given up on (logged, left in RUNNING).
    #[serde(default = "default_task_run_timeout_secs")]
    pub task_run_timeout_secs: u64,

    /// Spawn-tree limits, §4.F.
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: i32,
    #[serde(default = "default_max_children_per_session")]
    pub max_children_per_session: i32,
    #[serde(default = "default_max_total_instances")]
    pub max_total_instances: i32,

    /// Scheduler worker-pool size and misfire grace, §4.I / §5.
    #[serde(default = "default_scheduler_pool_size")]
    pub scheduler_pool_size: usize,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: i64,

    /// PlatformBridge ask defaults, §4.J.
    #[serde(default = "default_ask_poll_interval_secs")]
    pub ask_poll_interval_secs: u64,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Idle container teardown is session-scoped: a session idle longer than
    /// this is a candidate for the idle monitor's advisory sweep (0 disables it).
    #[serde(default = "default_idle_monitor_interval_secs")]
    pub idle_monitor_interval_secs: u64,

    /// Chat-platform client used by PlatformBridge.
    #[serde(default)]
    pub chat_platform_url: Option<String>,
    #[serde(default)]
    pub chat_platform_token: Option<String>,
    #[serde(default)]
    pub chat_platform_channel_id: Option<String>,
}

fn default_database_pool_size() -> u32 {
    5
}
fn default_object_store_bucket() -> String {
    "session-workspaces".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:8000".into()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9000".into()
}
fn default_bearer_algorithm() -> String {
    "hmac-sha256".into()
}
fn default_ssh_timeout_secs() -> u64 {
    30
}
fn default_vm_user() -> String {
    "agent".into()
}
fn default_ssh_key_path() -> String {
    "/secrets/ssh/id_ed25519".into()
}
fn default_container_runtime() -> String {
    "podman".into()
}
fn default_container_image() -> String {
    "agent-worker:latest".into()
}
fn default_container_network() -> String {
    "isolated".into()
}
fn default_container_cpu_limit() -> String {
    "2".into()
}
fn default_container_memory_limit() -> String {
    "4g".into()
}
fn default_container_startup_timeout_secs() -> u64 {
    60
}
fn default_session_idle_timeout_secs() -> u64 {
    300
}
fn default_chat_blocking_timeout_secs() -> u64 {
    600
}
fn default_task_run_timeout_secs() -> u64 {
    3600
}
fn default_max_spawn_depth() -> i32 {
    5
}
fn default_max_children_per_session() -> i32 {
    10
}
fn default_max_total_instances() -> i32 {
    50
}
fn default_scheduler_pool_size() -> usize {
    4
}
fn default_misfire_grace_secs() -> i64 {
    300
}
fn default_ask_poll_interval_secs() -> u64 {
    1
}
fn default_rate_limit_rps() -> u32 {
    10
}
fn default_rate_limit_burst() -> u32 {
    20
}
fn default_idle_monitor_interval_secs() -> u64 {
    60
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Load settings once from the environment (prefix `GATEWAY_`) and return
/// the process-wide singleton. Panics on missing required fields or
/// malformed values — configuration errors belong at startup, not deep
/// inside a request handler.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("GATEWAY"))
            .build()
            .expect("failed to build configuration")
            .try_deserialize()
            .expect("failed to deserialize configuration")
    })
}

#[cfg(test)]
pub fn init_for_test(overrides: &[(&str, &str)]) -> &'static Settings {
    SETTINGS.get_or_init(|| {
        let mut builder = config::Config::builder()
            .set_default("database_url", "postgres://localhost/test")
            .unwrap()
            .set_default("bus_url", "redis://localhost")
            .unwrap()
            .set_default("bearer_secret", "test-secret")
            .unwrap()
            .set_default("vm_host", "localhost")
            .unwrap();
        for (k, v) in overrides {
            builder = builder.set_override(*k, *v).unwrap();
        }
        builder
            .build()
            .unwrap()
            .try_deserialize()
            .expect("failed to deserialize test configuration")
    })
}
