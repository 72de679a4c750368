//! NATS JetStream broker.
//!
//! One stream captures `chat.events.>`. Routing flags are carried both as
//! message headers and in the subject, and the two subscriptions are durable
//! pull consumers filtering on the subject:
//!
//! ```text
//! CHAT_EVENTS (chat.events.>)
//!   ├── persistence            filter chat.events.p1.*   shared by storage writers
//!   └── broadcast-{instance}   filter chat.events.*.b1   one per gateway instance
//! ```

use crate::client::{NatsClient, StreamConfig, DEFAULT_STREAM_NAME};
use crate::error::{BrokerError, Result};
use crate::traits::{Acker, Broker, Delivery, DeliveryStream};
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::message::AckKind;
use async_nats::jetstream::stream::Stream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use common::{
    RoutingEnvelope, RoutingHeaders, Subscription, BROADCAST_HEADER, CHAT_EVENTS_SUBJECT_PREFIX,
    ORIGIN_HEADER, PERSISTENCE_HEADER,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::info;

/// Redelivery ceiling for nacked messages.
pub const DEFAULT_MAX_DELIVER: i64 = 10;

/// Broadcast consumers of instances gone this long are removed by the server.
pub const DEFAULT_BROADCAST_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// Configuration for the JetStream broker.
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Stream name.
    pub stream_name: String,
    /// Durable name of the shared persistence consumer.
    pub persistence_consumer: String,
    /// Identity of this process, used to name its broadcast consumer.
    pub instance_id: String,
    /// Redelivery ceiling.
    pub max_deliver: i64,
    /// Idle time after which an instance's broadcast consumer is deleted.
    pub broadcast_inactive_threshold: Duration,
}

impl JetStreamConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            persistence_consumer: "persistence".to_string(),
            instance_id: instance_id.into(),
            max_deliver: DEFAULT_MAX_DELIVER,
            broadcast_inactive_threshold: DEFAULT_BROADCAST_INACTIVE_THRESHOLD,
        }
    }

    /// Durable consumer name for a subscription.
    pub fn consumer_name(&self, subscription: Subscription) -> String {
        match subscription {
            Subscription::Persistence => self.persistence_consumer.clone(),
            Subscription::Broadcast => format!("broadcast-{}", self.instance_id),
        }
    }

    fn consumer_config(&self, subscription: Subscription) -> pull::Config {
        let base = pull::Config {
            durable_name: Some(self.consumer_name(subscription)),
            filter_subject: subscription.filter_subject(),
            ack_policy: AckPolicy::Explicit,
            max_deliver: self.max_deliver,
            ..Default::default()
        };

        match subscription {
            Subscription::Persistence => pull::Config {
                deliver_policy: DeliverPolicy::All,
                ..base
            },
            // Live delivery is only useful for connections held right now.
            Subscription::Broadcast => pull::Config {
                deliver_policy: DeliverPolicy::New,
                inactive_threshold: self.broadcast_inactive_threshold,
                ..base
            },
        }
    }
}

/// JetStream-backed broker.
pub struct JetStreamBroker {
    client: NatsClient,
    stream: Stream,
    config: JetStreamConfig,
}

impl JetStreamBroker {
    /// Ensure the chat events stream exists and return a broker over it.
    pub async fn connect(client: NatsClient, config: JetStreamConfig) -> Result<Self> {
        let stream_config = StreamConfig::for_prefix(&config.stream_name, CHAT_EVENTS_SUBJECT_PREFIX);
        let stream = client.ensure_stream(&stream_config).await?;

        info!(
            "JetStream broker ready (stream: {}, instance: {})",
            config.stream_name, config.instance_id
        );

        Ok(Self {
            client,
            stream,
            config,
        })
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn publish(&self, envelope: &RoutingEnvelope) -> Result<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in envelope.header_pairs() {
            headers.insert(name, value.as_str());
        }
        let payload = bytes::Bytes::from(envelope.encode_payload()?);

        self.client
            .publish_with_headers(envelope.subject(), headers, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<DeliveryStream> {
        let consumer = self
            .client
            .durable_pull_consumer(&self.stream, self.config.consumer_config(subscription))
            .await?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Nats(e.into()))?;

        let stream = messages.map(|item| match item {
            Ok(message) => Ok(into_delivery(message)),
            Err(e) => Err(BrokerError::Nats(anyhow::anyhow!(e))),
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

fn into_delivery(message: async_nats::jetstream::Message) -> Delivery {
    let header = |name: &str| {
        message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str().to_string())
    };
    let persistence = header(PERSISTENCE_HEADER);
    let broadcast = header(BROADCAST_HEADER);
    let origin = header(ORIGIN_HEADER);

    let envelope = RoutingHeaders::from_values(persistence.as_deref(), broadcast.as_deref())
        .and_then(|headers| RoutingEnvelope::decode(headers, origin.as_deref(), &message.payload));

    Delivery::new(
        message.subject.to_string(),
        envelope,
        Box::new(JetStreamAcker { message }),
    )
}

struct JetStreamAcker {
    message: async_nats::jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Nats(anyhow::anyhow!(e)))
    }

    async fn nak(self: Box<Self>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Nats(anyhow::anyhow!(e)))
    }
}
