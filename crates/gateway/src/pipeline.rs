//! Message delivery pipeline.
//!
//! ```text
//! Received ─▶ Validated ─▶ Stamped ─▶ LocallyDelivered ──┐
//!     │                        └────▶ LocallyUnreachable ─┴▶ Published ─▶ Acked
//!     └─▶ Rejected
//! ```
//!
//! A message is always published for persistence. The broadcast flag is set
//! only when this instance could not reach the recipient itself, so other
//! instances get a chance to.

use crate::config::PipelineConfig;
use crate::error::GatewayError;
use crate::fanout::{deliver_local, FanOutReport};
use crate::presence::PresenceTracker;
use crate::protocol::{InboundMessage, ServerFrame};
use crate::registry::{Connection, ConnectionRegistry};
use broker::BrokerRouter;
use common::{DeliveryTarget, Message, MessageDraft, RoutingEnvelope, RoutingHeaders};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Failed validation. Nothing was published.
    Rejected(Vec<String>),
    /// Published. `message` carries the status recorded for persistence.
    Sent {
        message: Message,
        headers: RoutingHeaders,
    },
    /// Publishing failed after retries. The sender was told.
    Failed { message: Message, error: String },
}

/// Check an inbound payload, returning per-field errors.
pub fn validate(input: &InboundMessage, max_content_length: usize) -> Result<MessageDraft, Vec<String>> {
    let mut errors = Vec::new();

    let content = input.content.as_deref().unwrap_or_default();
    if content.trim().is_empty() {
        errors.push(field_error("content", "required"));
    } else if content.chars().count() > max_content_length {
        errors.push(field_error("content", &format!("max={}", max_content_length)));
    }

    let room_id = input.room_id.as_deref().map(str::trim);
    if room_id == Some("") {
        errors.push(field_error("room_id", "required"));
    }

    match input.receiver_id {
        Some(id) if id <= 0 => errors.push(field_error("receiver_id", "gt=0")),
        Some(_) => {}
        None if room_id.is_none() => {
            errors.push(field_error("receiver_id", "required_without=room_id"))
        }
        None => {}
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(MessageDraft {
        room_id: room_id.map(str::to_string),
        receiver_id: input.receiver_id,
        content: content.to_string(),
        temp_id: input.temp_id.clone(),
    })
}

fn field_error(field: &str, rule: &str) -> String {
    format!("Field '{}' is invalid: {}", field, rule)
}

/// Runs inbound messages from one connection through validation, local
/// fan-out and publishing.
pub struct DeliveryPipeline {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTracker,
    router: BrokerRouter,
    config: PipelineConfig,
    instance_id: String,
}

impl DeliveryPipeline {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: PresenceTracker,
        router: BrokerRouter,
        config: PipelineConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            presence,
            router,
            config,
            instance_id: instance_id.into(),
        }
    }

    /// Process one message from `origin` and acknowledge it to the sender.
    pub async fn process(&self, origin: &Arc<Connection>, input: InboundMessage) -> PipelineOutcome {
        let temp_id = input.temp_id.clone();

        let draft = match validate(&input, self.config.max_content_length) {
            Ok(draft) => draft,
            Err(errors) => {
                counter!("gateway_messages_rejected_total").increment(1);
                info!("Message from {} rejected: {}", origin.id, GatewayError::Validation(errors.clone()));
                self.reply(origin, &ServerFrame::validation_error(temp_id, errors.clone()));
                return PipelineOutcome::Rejected(errors);
            }
        };

        let mut message = Message::stamp(draft, origin.user_id, origin.id);
        counter!("gateway_messages_received_total").increment(1);

        let report = deliver_local(&self.registry, &message);
        if report.hit() {
            message.mark_delivered();
        }

        let broadcast = self.should_broadcast(&message, &report).await;
        let envelope =
            RoutingEnvelope::new(message, broadcast).with_origin(self.instance_id.as_str());

        match self.router.publish(&envelope).await {
            Ok(()) => {
                debug!(
                    "Message {} from {} published (status: {}, broadcast: {})",
                    envelope.message.id(),
                    origin.id,
                    envelope.message.status().as_str(),
                    broadcast
                );
                self.reply(origin, &ServerFrame::sent(temp_id, envelope.message.id()));
                PipelineOutcome::Sent {
                    message: envelope.message,
                    headers: envelope.headers,
                }
            }
            Err(e) => {
                warn!(
                    "Message {} from {} could not be published: {}",
                    envelope.message.id(),
                    origin.id,
                    e
                );
                self.reply(origin, &ServerFrame::send_failed(temp_id, envelope.message.id()));
                PipelineOutcome::Failed {
                    message: envelope.message,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn should_broadcast(&self, message: &Message, report: &FanOutReport) -> bool {
        if report.hit() {
            return self.config.broadcast_after_local_hit;
        }

        let Some(DeliveryTarget::User(user_id)) = message.delivery_target() else {
            return true;
        };

        match self.presence.is_online(user_id).await {
            Ok(true) => true,
            Ok(false) => {
                debug!("Recipient {} is offline", user_id);
                self.config.broadcast_when_offline
            }
            Err(e) => {
                warn!("Presence lookup for user {} failed: {}", user_id, e);
                true
            }
        }
    }

    fn reply(&self, origin: &Connection, frame: &ServerFrame) {
        if let Err(e) = origin.send(frame) {
            warn!("Failed to acknowledge to {}: {}", origin.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::InMemoryPresenceStore;
    use axum::extract::ws::Message as WsMessage;
    use crate::broadcast::BroadcastConsumer;
    use broker::{Broker, EnvelopeHandler, InMemoryBroker, RetryPolicy};
    use common::{MessageStatus, Subscription};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const INSTANCE: &str = "gw-test";

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        presence: PresenceTracker,
        broker: Arc<InMemoryBroker>,
        pipeline: DeliveryPipeline,
    }

    fn harness(config: PipelineConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceTracker::new(Arc::new(InMemoryPresenceStore::new()));
        let broker = Arc::new(InMemoryBroker::new());
        let router = BrokerRouter::new(broker.clone(), RetryPolicy::new(2, Duration::from_millis(1)));
        let pipeline = DeliveryPipeline::new(registry.clone(), presence.clone(), router, config, INSTANCE);
        Harness {
            registry,
            presence,
            broker,
            pipeline,
        }
    }

    async fn connect(h: &Harness, user_id: i64) -> (Arc<Connection>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let connection = Arc::new(Connection::new(user_id, tx));
        h.registry.add(connection.clone());
        h.presence.mark_online(user_id).await.unwrap();
        (connection, rx)
    }

    fn frames(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(WsMessage::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(text.as_str()).unwrap());
        }
        out
    }

    fn to_user(receiver_id: i64, content: &str) -> InboundMessage {
        InboundMessage {
            receiver_id: Some(receiver_id),
            content: Some(content.to_string()),
            temp_id: Some("tmp-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validation_messages() {
        let errors = validate(&InboundMessage::default(), 10).unwrap_err();
        assert_eq!(
            errors,
            vec![
                "Field 'content' is invalid: required".to_string(),
                "Field 'receiver_id' is invalid: required_without=room_id".to_string(),
            ]
        );

        let errors = validate(
            &InboundMessage {
                room_id: Some(" ".into()),
                receiver_id: Some(-1),
                content: Some("x".repeat(11)),
                temp_id: None,
            },
            10,
        )
        .unwrap_err();
        assert_eq!(
            errors,
            vec![
                "Field 'content' is invalid: max=10".to_string(),
                "Field 'room_id' is invalid: required".to_string(),
                "Field 'receiver_id' is invalid: gt=0".to_string(),
            ]
        );

        let draft = validate(
            &InboundMessage {
                room_id: Some("general".into()),
                content: Some("hi".into()),
                ..Default::default()
            },
            10,
        )
        .unwrap();
        assert_eq!(draft.room_id.as_deref(), Some("general"));
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_published() {
        let h = harness(PipelineConfig::default());
        let (alice, mut alice_rx) = connect(&h, 1).await;

        let outcome = h
            .pipeline
            .process(&alice, InboundMessage { receiver_id: Some(2), ..Default::default() })
            .await;

        assert!(matches!(outcome, PipelineOutcome::Rejected(_)));
        assert_eq!(h.broker.published_count(), 0);
        let replies = frames(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "validation_error");
        assert_eq!(replies[0]["errors"][0], "Field 'content' is invalid: required");
    }

    #[tokio::test]
    async fn test_unreachable_recipient_stays_pending_and_broadcasts() {
        let h = harness(PipelineConfig::default());
        let (alice, mut alice_rx) = connect(&h, 1).await;

        let outcome = h.pipeline.process(&alice, to_user(2, "hi")).await;

        let PipelineOutcome::Sent { message, headers } = outcome else {
            panic!("expected the message to be sent");
        };
        assert_eq!(message.status(), MessageStatus::Pending);
        assert!(headers.persistence());
        assert!(headers.broadcast());
        assert_eq!(message.sender_id, 1);
        assert_eq!(message.sender_device, alice.id);

        let replies = frames(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "ack");
        assert_eq!(replies[0]["status"], "sent");
        assert_eq!(replies[0]["id"], "tmp-1");
        assert_eq!(replies[0]["message_id"], message.id().to_string());
    }

    #[tokio::test]
    async fn test_local_recipient_is_delivered_without_broadcast() {
        let h = harness(PipelineConfig::default());
        let (alice, mut alice_rx) = connect(&h, 1).await;
        let (_bob, mut bob_rx) = connect(&h, 2).await;

        let outcome = h.pipeline.process(&alice, to_user(2, "hi bob")).await;

        let PipelineOutcome::Sent { message, headers } = outcome else {
            panic!("expected the message to be sent");
        };
        assert_eq!(message.status(), MessageStatus::Delivered);
        assert!(headers.persistence());
        assert!(!headers.broadcast());

        let delivered = frames(&mut bob_rx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0]["content"], "hi bob");
        assert_eq!(frames(&mut alice_rx)[0]["status"], "sent");
    }

    #[tokio::test]
    async fn test_broadcast_policies() {
        let h = harness(PipelineConfig {
            broadcast_when_offline: false,
            ..Default::default()
        });
        let (alice, _rx) = connect(&h, 1).await;
        let outcome = h.pipeline.process(&alice, to_user(2, "hi")).await;
        assert!(matches!(outcome, PipelineOutcome::Sent { headers, .. } if !headers.broadcast()));

        let h = harness(PipelineConfig {
            broadcast_after_local_hit: true,
            ..Default::default()
        });
        let mut broadcasts = h.broker.subscribe(Subscription::Broadcast).await.unwrap();
        let (alice, _rx1) = connect(&h, 1).await;
        let (_bob, mut bob_rx) = connect(&h, 2).await;
        let outcome = h.pipeline.process(&alice, to_user(2, "hi")).await;
        assert!(matches!(outcome, PipelineOutcome::Sent { headers, .. } if headers.broadcast()));

        // This instance's own consumer sees the broadcast too.
        let delivery = tokio::time::timeout(Duration::from_millis(100), broadcasts.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let consumer = BroadcastConsumer::new(
            h.registry.clone(),
            BrokerRouter::new(h.broker.clone(), RetryPolicy::default()),
            INSTANCE,
        );
        consumer.handle(delivery.envelope().unwrap()).await.unwrap();
        delivery.ack().await.unwrap();

        assert_eq!(frames(&mut bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_to_sender() {
        let h = harness(PipelineConfig::default());
        let (alice, mut alice_rx) = connect(&h, 1).await;
        h.broker.inject_publish_failures(5);

        let outcome = h.pipeline.process(&alice, to_user(2, "hi")).await;

        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
        let replies = frames(&mut alice_rx);
        assert_eq!(replies[0]["type"], "ack");
        assert_eq!(replies[0]["status"], "error");
        assert_eq!(replies[0]["id"], "tmp-1");
    }
}
