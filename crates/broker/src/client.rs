//! NATS client wrapper with JetStream support.

use anyhow::Result;
use async_nats::jetstream::{self, consumer::pull, stream::Stream};
use async_nats::{Client, HeaderMap};
use std::time::Duration;
use tracing::info;

/// Default stream name for chat events.
pub const DEFAULT_STREAM_NAME: &str = "CHAT_EVENTS";

/// Default retention period for chat events (7 days).
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 10_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Stream capturing every subject under `{prefix}.>`.
    pub fn for_prefix(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            subjects: vec![format!("{}.>", prefix)],
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Create or get a stream with the given configuration.
    ///
    /// Limits retention keeps every message available to every consumer,
    /// so the persistence and broadcast consumers see the same publishes.
    pub async fn ensure_stream(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s)",
            config.name, config.subjects, config.max_age_secs
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Create or attach to a durable pull consumer on a stream.
    pub async fn durable_pull_consumer(
        &self,
        stream: &Stream,
        config: pull::Config,
    ) -> Result<jetstream::consumer::Consumer<pull::Config>> {
        let name = config
            .durable_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("durable consumer requires a name"))?;
        info!(
            "Attaching durable consumer '{}' (filter: {})",
            name, config.filter_subject
        );
        let consumer = stream.get_or_create_consumer(&name, config).await?;
        Ok(consumer)
    }

    /// Publish a message with headers to JetStream and wait for the ack.
    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        self.jetstream
            .publish_with_headers(subject.into(), headers, payload)
            .await?
            .await?;
        Ok(())
    }

    /// Round-trip to the server, used by health checks.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}
