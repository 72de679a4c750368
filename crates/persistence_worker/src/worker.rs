//! Persistence consumer: broker → message store.

use crate::store::{conversation_id, MessageStore};
use async_trait::async_trait;
use broker::{BrokerRouter, ConsumeStats, EnvelopeHandler};
use common::RoutingEnvelope;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Writes every persisted envelope to the store exactly once.
///
/// Deliveries are at-least-once, so a redelivered or duplicated envelope is
/// recognised by message id and acknowledged without a second record.
pub struct PersistenceWorker {
    store: Arc<dyn MessageStore>,
    router: BrokerRouter,
}

impl PersistenceWorker {
    pub fn new(store: Arc<dyn MessageStore>, router: BrokerRouter) -> Self {
        Self { store, router }
    }

    /// Run until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> broker::Result<ConsumeStats> {
        info!("Starting PersistenceWorker (store: {})", self.store.name());
        self.router.consume_persistence(self.as_ref(), shutdown_rx).await
    }
}

#[async_trait]
impl EnvelopeHandler for PersistenceWorker {
    async fn handle(&self, envelope: &RoutingEnvelope) -> anyhow::Result<()> {
        let message = &envelope.message;
        let room_id = conversation_id(message);

        let mut participants = vec![message.sender_id];
        participants.extend(message.receiver_id);
        self.store.add_participants(&room_id, &participants).await?;

        if self.store.save(&room_id, message).await? {
            counter!("persistence_messages_stored_total").increment(1);
            debug!(
                "Stored message {} in room {} ({})",
                message.id(),
                room_id,
                message.status().as_str()
            );
        } else {
            counter!("persistence_duplicates_total").increment(1);
            debug!("Message {} already stored, skipping", message.id());
        }
        Ok(())
    }
}
