use std::sync::Arc;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use chat_client::Mattermost;
use common::bus::BusClient;
use common::rate_limit::{self, RateLimitLayer};
use gateway::config;
use gateway::container_driver::ContainerDriver;
use gateway::health::HealthAggregator;
use gateway::http::{self, AppState};
use gateway::idle_monitor;
use gateway::liveness::LivenessState;
use gateway::object_store::ObjectStoreClient;
use gateway::platform_bridge::PlatformBridge;
use gateway::scheduler::Scheduler;
use gateway::session_service::SessionService;
use gateway::ssh;
use gateway::store::{ask_store, session_store, task_store, AskStore, SessionStore, TaskStore};
use gateway::task_service::TaskService;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    ssh::init_ssh_key()?;

    let s = config::settings();

    let pool = PgPoolOptions::new()
        .max_connections(s.database_pool_size)
        .connect(&s.database_url)
        .await?;
    session_store::create_schema(&pool).await?;
    task_store::create_schema(&pool).await?;
    ask_store::create_schema(&pool).await?;
    tracing::info!(pool_size = s.database_pool_size, "database pool initialized");

    let bus = BusClient::connect(&s.bus_url).await?;

    let object_store = match (&s.object_store_url, &s.object_store_access_key, &s.object_store_secret_key) {
        (Some(endpoint), Some(access_key), Some(secret_key)) => {
            Some(ObjectStoreClient::new(endpoint, access_key, secret_key, &s.object_store_bucket)?)
        }
        _ => {
            tracing::warn!("object store not configured, snapshots and artifacts are unavailable");
            None
        }
    };

    let chat = match (&s.chat_platform_url, &s.chat_platform_token) {
        (Some(url), Some(token)) => Some(Mattermost::new(url, token).await?),
        _ => {
            tracing::warn!("chat platform not configured, ask/notify will only persist, not post");
            None
        }
    };

    let session_store = SessionStore::new(pool.clone());
    let task_store = TaskStore::new(pool.clone());
    let ask_store = AskStore::new(pool.clone());

    let containers = ContainerDriver::new();
    let liveness = Arc::new(LivenessState::new());

    let sessions = SessionService::new(session_store.clone(), bus.clone(), containers.clone(), liveness.clone());
    let platform = PlatformBridge::new(chat, bus.clone(), ask_store);
    let tasks = TaskService::new(task_store.clone(), platform.clone(), bus.clone());
    let scheduler = Scheduler::new(task_store.clone(), tasks.clone(), sessions.clone());
    let health = HealthAggregator::new(bus.clone(), session_store.clone(), containers.clone(), object_store.clone());

    scheduler.reload_all_schedules().await?;

    let state = Arc::new(AppState {
        sessions,
        tasks,
        platform,
        scheduler: scheduler.clone(),
        health,
        bus: bus.clone(),
        session_store: session_store.clone(),
        containers: containers.clone(),
    });

    let cancel_token = CancellationToken::new();

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let cancel = cancel_token.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let idle_monitor_handle =
        idle_monitor::spawn_idle_monitor(session_store.clone(), liveness.clone(), cancel_token.clone()).await;

    let rate_limiter = RateLimitLayer::new(s.rate_limit_rps, s.rate_limit_burst);
    let rate_limit_handle = rate_limit::spawn_cleanup_task(rate_limiter.clone(), cancel_token.clone());

    let app = http::router(state, rate_limiter, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&s.listen_addr).await?;
    tracing::info!("listening on {}", s.listen_addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    tracing::info!("cancelling background tasks");
    cancel_token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = scheduler_handle.await;
        let _ = idle_monitor_handle.await;
        let _ = rate_limit_handle.await;
    })
    .await;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel_token.cancelled() => {},
    }

    tracing::info!("shutdown signal received, starting graceful shutdown");
}
