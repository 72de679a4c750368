//! Broadcast consumer: broker → local WebSocket fan-out.
//!
//! Every gateway instance drains its own broadcast subscription and re-offers
//! each message to the recipient's connections registered here. Envelopes for
//! users this instance does not hold are acknowledged and dropped, as are
//! envelopes this instance published itself.

use crate::fanout::deliver_local;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use broker::{BrokerRouter, ConsumeStats, EnvelopeHandler};
use common::RoutingEnvelope;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Re-offers broadcast envelopes to local connections.
pub struct BroadcastConsumer {
    registry: Arc<ConnectionRegistry>,
    router: BrokerRouter,
    instance_id: String,
}

impl BroadcastConsumer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: BrokerRouter,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            router,
            instance_id: instance_id.into(),
        }
    }

    /// Run until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> broker::Result<ConsumeStats> {
        info!("Starting BroadcastConsumer");
        self.router.consume_broadcast(self.as_ref(), shutdown_rx).await
    }
}

#[async_trait]
impl EnvelopeHandler for BroadcastConsumer {
    async fn handle(&self, envelope: &RoutingEnvelope) -> anyhow::Result<()> {
        counter!("gateway_broadcasts_received_total").increment(1);

        // Local delivery already ran before publish.
        if envelope.is_from(&self.instance_id) {
            debug!("Skipping own broadcast of message {}", envelope.message.id());
            return Ok(());
        }

        let report = deliver_local(&self.registry, &envelope.message);
        if report.targets == 0 {
            debug!("No local connections for message {}", envelope.message.id());
            return Ok(());
        }

        // Every matched device refused the write; let another delivery try.
        if !report.hit() {
            anyhow::bail!(
                "all {} local writes of message {} failed",
                report.failed,
                envelope.message.id()
            );
        }

        counter!("gateway_broadcasts_delivered_total").increment(1);
        Ok(())
    }
}
