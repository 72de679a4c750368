//! Gateway error types.

use common::ConnectionId;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Inbound payload is incomplete or malformed. Reported to the sender only.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Frame could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message frame with a field of the wrong type. Carries the client's
    /// temp id when one could be read.
    #[error("Protocol error: {reason}")]
    MalformedMessage {
        temp_id: Option<String>,
        reason: String,
    },

    /// Connection-level I/O failure. Terminal for that connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Broker publish failed after retries.
    #[error("Broker publish error: {0}")]
    BrokerPublish(#[from] broker::BrokerError),

    /// Write to a connection handle that already closed or is saturated.
    #[error("Connection {0} is closed or not keeping up")]
    RegistryInconsistency(ConnectionId),

    /// Connection not found in the registry.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Presence store (Redis) error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Identity could not be established for an upgrade request.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
