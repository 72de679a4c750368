//! Persistence worker entry point.
//!
//! Consumes the persistence subscription into the message store and serves
//! room history over HTTP.

use anyhow::Result;
use broker::{Broker, BrokerRouter, JetStreamBroker, JetStreamConfig, NatsClient, RetryPolicy};
use metrics_exporter_prometheus::PrometheusBuilder;
use persistence_worker::{
    create_router, AppState, InMemoryMessageStore, MessageStore, PersistenceWorker,
    RedisMessageStore, StoreBackend, WorkerConfig,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting persistence worker...");

    let config = WorkerConfig::from_env()?;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!(
        "Prometheus metrics available at http://0.0.0.0:{}/metrics",
        config.metrics_port
    );

    let client = NatsClient::connect(&config.nats_url).await?;
    let broker: Arc<dyn Broker> =
        Arc::new(JetStreamBroker::connect(client, JetStreamConfig::new(&config.instance_id)).await?);

    let store: Arc<dyn MessageStore> = match &config.store {
        StoreBackend::Redis { url } => {
            info!("Connecting to Redis at {}...", url);
            Arc::new(RedisMessageStore::connect(url).await?)
        }
        StoreBackend::Memory => Arc::new(InMemoryMessageStore::new()),
    };

    let router = BrokerRouter::new(broker, RetryPolicy::default());
    let worker = Arc::new(PersistenceWorker::new(store.clone(), router.clone()));

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let worker_handle = tokio::spawn(async move {
        match worker.run(shutdown_rx).await {
            Ok(stats) => info!(
                "Persistence consumer finished (acked: {}, nacked: {}, dropped: {})",
                stats.acked, stats.nacked, stats.dropped
            ),
            Err(e) => error!("Persistence consumer error: {:?}", e),
        }
    });

    let app = create_router(AppState { store, router });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("HTTP API listening on http://0.0.0.0:{}", config.http_port);
    info!("Available endpoints:");
    info!("  GET  /health                       - Health check");
    info!("  GET  /rooms/{{room_id}}              - Room participants");
    info!("  GET  /rooms/{{room_id}}/messages     - Room history (?limit=)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(()).await;
    let _ = worker_handle.await;

    info!("Persistence worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
}
