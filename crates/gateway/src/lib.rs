pub mod config;
pub mod container_driver;
pub mod health;
pub mod http;
pub mod idle_monitor;
pub mod liveness;
pub mod object_store;
pub mod platform_bridge;
pub mod scheduler;
pub mod session_service;
pub mod ssh;
pub mod store;
pub mod stream_bridge;
pub mod task_service;

pub use common::{bus, crypto, error, rate_limit};
