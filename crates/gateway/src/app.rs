//! Wiring of the gateway's components.

use crate::auth::{IdentityResolver, TokenVerifier};
use crate::broadcast::BroadcastConsumer;
use crate::config::{BrokerBackend, GatewayConfig, PresenceBackend};
use crate::error::Result;
use crate::pipeline::DeliveryPipeline;
use crate::presence::{InMemoryPresenceStore, PresenceStore, PresenceTracker, RedisPresenceStore};
use crate::registry::ConnectionRegistry;
use crate::ws_server::AppState;
use broker::{Broker, BrokerRouter, InMemoryBroker, JetStreamBroker, JetStreamConfig, NatsClient};
use std::sync::Arc;
use tracing::info;

/// A wired gateway: HTTP state plus the broadcast consumer to spawn.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub consumer: Arc<BroadcastConsumer>,
}

/// Build the gateway over the given broker and presence store.
pub fn build(
    config: &GatewayConfig,
    broker: Arc<dyn Broker>,
    presence_store: Arc<dyn PresenceStore>,
) -> Result<Gateway> {
    let verifier = config
        .token_key
        .as_ref()
        .map(TokenVerifier::from_key)
        .transpose()?;
    let identity = IdentityResolver::new(verifier, config.trust_user_id_param);

    let registry = Arc::new(ConnectionRegistry::new());
    let presence = PresenceTracker::new(presence_store);
    let router = BrokerRouter::new(broker, config.retry);

    let pipeline = Arc::new(DeliveryPipeline::new(
        registry.clone(),
        presence.clone(),
        router.clone(),
        config.pipeline.clone(),
        config.instance_id.clone(),
    ));
    let consumer = Arc::new(BroadcastConsumer::new(
        registry.clone(),
        router.clone(),
        config.instance_id.clone(),
    ));

    let state = Arc::new(AppState {
        registry,
        presence,
        pipeline,
        identity,
        router,
        instance_id: config.instance_id.clone(),
        settings: config.connection.clone(),
    });

    Ok(Gateway { state, consumer })
}

/// Connect the configured broker backend.
pub async fn connect_broker(config: &GatewayConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match &config.broker {
        BrokerBackend::JetStream { url } => {
            let client = NatsClient::connect(url).await?;
            let broker =
                JetStreamBroker::connect(client, JetStreamConfig::new(&config.instance_id)).await?;
            Ok(Arc::new(broker))
        }
        BrokerBackend::Memory => {
            info!("Using in-process broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
    }
}

/// Connect the configured presence store.
pub async fn connect_presence(config: &GatewayConfig) -> anyhow::Result<Arc<dyn PresenceStore>> {
    match &config.presence {
        PresenceBackend::Redis { url } => {
            let store = RedisPresenceStore::connect(url).await?;
            store.ping().await?;
            Ok(Arc::new(store))
        }
        PresenceBackend::Memory => {
            info!("Using in-process presence store");
            Ok(Arc::new(InMemoryPresenceStore::new()))
        }
    }
}
