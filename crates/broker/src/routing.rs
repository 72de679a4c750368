//! Broker routing layer: one outbound publish and two consume loops.

use crate::error::{BrokerError, Result};
use crate::retry::RetryPolicy;
use crate::traits::{Broker, Delivery, EnvelopeHandler};
use common::{RoutingEnvelope, Subscription};
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome counts of a consume loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    /// Handled successfully and acknowledged.
    pub acked: u64,
    /// Handler failed, negatively acknowledged for redelivery.
    pub nacked: u64,
    /// Undecodable, acknowledged and dropped.
    pub dropped: u64,
}

/// Routes envelopes through a [`Broker`] with bounded publish retries.
#[derive(Clone)]
pub struct BrokerRouter {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl BrokerRouter {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish an envelope, retrying transient failures.
    ///
    /// Returns [`BrokerError::PublishExhausted`] once the attempt ceiling is
    /// reached. Never blocks longer than the sum of the retry delays plus the
    /// attempts themselves.
    pub async fn publish(&self, envelope: &RoutingEnvelope) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.broker.publish(envelope).await {
                Ok(()) => {
                    counter!("broker_published_total", "broadcast" => envelope.headers.broadcast().to_string())
                        .increment(1);
                    debug!(
                        "Published message {} to {} (attempt {})",
                        envelope.message.id(),
                        envelope.subject(),
                        attempt
                    );
                    return Ok(());
                }
                Err(e) => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        counter!("broker_publish_retries_total").increment(1);
                        warn!(
                            "Publish of message {} failed (attempt {}/{}): {}, retrying in {:?}",
                            envelope.message.id(),
                            attempt,
                            self.retry.max_attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        counter!("broker_publish_failures_total").increment(1);
                        error!(
                            "Publish of message {} failed after {} attempts: {}",
                            envelope.message.id(),
                            attempt,
                            e
                        );
                        return Err(BrokerError::PublishExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Drain the persistence subscription into a durable-write handler.
    pub async fn consume_persistence<H>(
        &self,
        handler: &H,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<ConsumeStats>
    where
        H: EnvelopeHandler + ?Sized,
    {
        self.consume(Subscription::Persistence, handler, shutdown_rx)
            .await
    }

    /// Drain this instance's broadcast subscription into a local fan-out handler.
    pub async fn consume_broadcast<H>(
        &self,
        handler: &H,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<ConsumeStats>
    where
        H: EnvelopeHandler + ?Sized,
    {
        self.consume(Subscription::Broadcast, handler, shutdown_rx)
            .await
    }

    async fn consume<H>(
        &self,
        subscription: Subscription,
        handler: &H,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<ConsumeStats>
    where
        H: EnvelopeHandler + ?Sized,
    {
        let mut deliveries = self.broker.subscribe(subscription).await?;
        let mut stats = ConsumeStats::default();

        info!(
            "Consuming {} subscription via {}",
            subscription.name(),
            self.broker.name()
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("{} consumer received shutdown signal", subscription.name());
                    break;
                }

                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            dispatch(subscription, handler, delivery, &mut stats).await;
                        }
                        Some(Err(e)) => {
                            counter!("broker_consume_errors_total", "subscription" => subscription.name()).increment(1);
                            warn!("{} subscription error: {}", subscription.name(), e);
                        }
                        None => {
                            warn!("{} subscription ended unexpectedly", subscription.name());
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "{} consumer stopped (acked: {}, nacked: {}, dropped: {})",
            subscription.name(),
            stats.acked,
            stats.nacked,
            stats.dropped
        );
        Ok(stats)
    }
}

async fn dispatch<H>(
    subscription: Subscription,
    handler: &H,
    delivery: Delivery,
    stats: &mut ConsumeStats,
) where
    H: EnvelopeHandler + ?Sized,
{
    let name = subscription.name();
    let outcome = match delivery.envelope() {
        Err(e) => {
            warn!("Dropping undecodable envelope on {}: {}", delivery.subject(), e);
            None
        }
        Ok(envelope) => Some(handler.handle(envelope).await),
    };

    let settled = match outcome {
        None => {
            stats.dropped += 1;
            counter!("broker_envelopes_dropped_total", "subscription" => name).increment(1);
            delivery.ack().await
        }
        Some(Ok(())) => {
            stats.acked += 1;
            counter!("broker_envelopes_acked_total", "subscription" => name).increment(1);
            delivery.ack().await
        }
        Some(Err(e)) => {
            stats.nacked += 1;
            counter!("broker_envelopes_nacked_total", "subscription" => name).increment(1);
            warn!("{} handler failed, requesting redelivery: {:?}", name, e);
            delivery.nak().await
        }
    };

    if let Err(e) = settled {
        warn!("Failed to settle {} delivery: {}", name, e);
    }
}
