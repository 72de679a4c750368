//! Gateway service entry point.
//!
//! WebSocket gateway for real-time chat delivery.

use anyhow::Result;
use gateway::{
    build, connect_broker, connect_presence, create_router, drain_connections, run_idle_reaper,
    GatewayConfig,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for connections to finish their teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  INSTANCE_ID: {}", config.instance_id);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  BROKER: {:?}", config.broker);
    info!("  PRESENCE: {:?}", config.presence);
    info!("  PUBLISH_MAX_ATTEMPTS: {}", config.retry.max_attempts);
    info!("  TOKEN_VERIFICATION: {}", config.token_key.is_some());
    info!("  TRUST_USER_ID_PARAM: {}", config.trust_user_id_param);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let broker = connect_broker(&config).await?;
    let presence_store = connect_presence(&config).await?;

    let gateway = build(&config, broker, presence_store)?;
    let state = gateway.state.clone();

    // Broadcast consumer
    let (consumer_shutdown_tx, consumer_shutdown_rx) = mpsc::channel(1);
    let consumer = gateway.consumer.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_shutdown_rx).await {
            error!("Broadcast consumer error: {:?}", e);
        }
    });

    // Idle connection reaper
    let (reaper_shutdown_tx, reaper_shutdown_rx) = mpsc::channel(1);
    let reaper_handle = tokio::spawn(run_idle_reaper(
        state.registry.clone(),
        config.connection.idle_timeout,
        reaper_shutdown_rx,
    ));

    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No longer accepting; close live connections so each one runs its teardown.
    let remaining = drain_connections(&state.registry, DRAIN_TIMEOUT).await;
    if remaining > 0 {
        warn!("{} connections still open after drain timeout", remaining);
    }

    info!("Shutting down broadcast consumer...");
    let _ = reaper_shutdown_tx.send(()).await;
    let _ = consumer_shutdown_tx.send(()).await;
    let _ = reaper_handle.await;
    let _ = consumer_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
