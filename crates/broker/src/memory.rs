//! In-process header-routed broker.
//!
//! Every `subscribe` call binds a fresh queue to the exchange, the same way
//! each gateway instance binds its own broadcast consumer. Publishes are
//! copied into every queue whose filter matches the envelope subject.
//! Used for single-node runs and tests.

use crate::error::{BrokerError, Result};
use crate::traits::{Acker, Broker, Delivery, DeliveryStream};
use async_trait::async_trait;
use bytes::Bytes;
use common::subject::matches_subject;
use common::{
    RoutingEnvelope, RoutingHeaders, Subscription, BROADCAST_HEADER, ORIGIN_HEADER, PERSISTENCE_HEADER,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Deliveries after which a repeatedly nacked message is dropped.
pub const MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone)]
struct QueuedMessage {
    subject: String,
    headers: HashMap<String, String>,
    payload: Bytes,
    deliveries: u32,
}

struct Binding {
    filter: String,
    tx: mpsc::UnboundedSender<QueuedMessage>,
}

/// Header-routed broker living in the current process.
#[derive(Default)]
pub struct InMemoryBroker {
    bindings: Mutex<Vec<Binding>>,
    pending_failures: AtomicU32,
    published: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail as if the broker were down.
    pub fn inject_publish_failures(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful publishes.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Route a raw message, bypassing envelope encoding.
    pub(crate) async fn publish_raw(
        &self,
        subject: String,
        headers: HashMap<String, String>,
        payload: Bytes,
    ) {
        let mut bindings = self.bindings.lock().await;
        bindings.retain(|binding| !binding.tx.is_closed());

        let mut routed = 0;
        for binding in bindings
            .iter()
            .filter(|binding| matches_subject(&binding.filter, &subject))
        {
            let queued = QueuedMessage {
                subject: subject.clone(),
                headers: headers.clone(),
                payload: payload.clone(),
                deliveries: 0,
            };
            if binding.tx.send(queued).is_ok() {
                routed += 1;
            }
        }
        debug!("Routed {} to {} queues", subject, routed);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &RoutingEnvelope) -> Result<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Unavailable(
                "in-memory broker rejected publish".to_string(),
            ));
        }

        let headers = envelope
            .header_pairs()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let payload = Bytes::from(envelope.encode_payload()?);

        self.publish_raw(envelope.subject(), headers, payload).await;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel::<QueuedMessage>();
        self.bindings.lock().await.push(Binding {
            filter: subscription.filter_subject(),
            tx: tx.clone(),
        });

        let stream = futures::stream::unfold((rx, tx), |(mut rx, tx)| async move {
            let queued = rx.recv().await?;
            let delivery = into_delivery(queued, tx.clone());
            Some((Ok(delivery), (rx, tx)))
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn into_delivery(queued: QueuedMessage, requeue: mpsc::UnboundedSender<QueuedMessage>) -> Delivery {
    let header = |name: &str| queued.headers.get(name).map(String::as_str);
    let envelope = RoutingHeaders::from_values(header(PERSISTENCE_HEADER), header(BROADCAST_HEADER))
        .and_then(|headers| {
            RoutingEnvelope::decode(headers, header(ORIGIN_HEADER), &queued.payload)
        });

    Delivery::new(
        queued.subject.clone(),
        envelope,
        Box::new(MemoryAcker {
            message: queued,
            requeue,
        }),
    )
}

struct MemoryAcker {
    message: QueuedMessage,
    requeue: mpsc::UnboundedSender<QueuedMessage>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nak(self: Box<Self>) -> Result<()> {
        let mut message = self.message;
        message.deliveries += 1;
        if message.deliveries >= MAX_DELIVERIES {
            warn!(
                "Dropping {} after {} deliveries",
                message.subject, message.deliveries
            );
            return Ok(());
        }
        self.requeue
            .send(message)
            .map_err(|_| BrokerError::Unavailable("subscription closed".to_string()))
    }
}
