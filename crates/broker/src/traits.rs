//! Broker seams.
//!
//! A [`Broker`] performs one publish attempt and opens subscription streams.
//! Retry policy and consume loops live in [`crate::routing::BrokerRouter`] so
//! every broker implementation gets the same delivery semantics.

use crate::error::Result;
use async_trait::async_trait;
use common::{RoutingEnvelope, Subscription};
use futures::stream::BoxStream;

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Message-queue backend able to route one publish to both subscriptions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Backend name for logs (e.g., "jetstream", "memory").
    fn name(&self) -> &'static str;

    /// Single publish attempt. Retries are the caller's concern.
    async fn publish(&self, envelope: &RoutingEnvelope) -> Result<()>;

    /// Open the given subscription.
    async fn subscribe(&self, subscription: Subscription) -> Result<DeliveryStream>;

    /// Check if the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Settles one delivery with the backend.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positive acknowledgement: do not redeliver.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negative acknowledgement: redeliver later.
    async fn nak(self: Box<Self>) -> Result<()>;
}

/// Handles envelopes drained from a subscription.
///
/// `Ok` acks the delivery, `Err` naks it for redelivery.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &RoutingEnvelope) -> anyhow::Result<()>;
}

/// One message received from a subscription.
pub struct Delivery {
    subject: String,
    envelope: common::Result<RoutingEnvelope>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        envelope: common::Result<RoutingEnvelope>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            envelope,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The decoded envelope, or the decode error for a poison message.
    pub fn envelope(&self) -> std::result::Result<&RoutingEnvelope, &common::Error> {
        self.envelope.as_ref()
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(self) -> Result<()> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}
