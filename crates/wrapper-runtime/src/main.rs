use anyhow::Result;
use tokio_util::sync::CancellationToken;

use common::bus::{keys, BusClient};
use wrapper_runtime::config;
use wrapper_runtime::config_generator::ConfigGenerator;
use wrapper_runtime::health_emitter;
use wrapper_runtime::interactive_loop::InteractiveLoop;
use wrapper_runtime::interrupt_listener;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = config::settings();
    tracing::info!(session_id = %settings.session_id, "starting wrapper");

    ConfigGenerator::new(settings).generate_all();

    let bus = BusClient::connect(&settings.redis_url).await?;
    let cancel_token = CancellationToken::new();

    let health_handle = {
        let bus = bus.clone();
        let settings = settings.clone();
        let cancel = cancel_token.clone();
        tokio::spawn(async move { health_emitter::run(bus, &settings, cancel).await })
    };

    let interrupt_handle = {
        let bus = bus.clone();
        let settings = settings.clone();
        let cancel = cancel_token.clone();
        tokio::spawn(async move { interrupt_listener::run(bus, &settings, cancel).await })
    };

    let mut main_loop = {
        let cancel = cancel_token.clone();
        let bus = bus.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let mut interactive = InteractiveLoop::new(bus, settings);
            interactive.run(cancel).await;
        })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        _ = &mut main_loop => {
            tracing::info!("interactive loop ended on its own (likely a stop interrupt)");
        }
    }

    cancel_token.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        let _ = main_loop.await;
        let _ = health_handle.await;
        let _ = interrupt_handle.await;
    })
    .await;

    let state_key = keys::state(&settings.session_id);
    let _ = bus.hash_set(&state_key, "status", "stopped").await;

    tracing::info!("wrapper shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
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
    }
}
