//! Broker error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// NATS / JetStream failure (from the client wrapper).
    #[error("NATS error: {0}")]
    Nats(#[from] anyhow::Error),

    /// Envelope could not be encoded or decoded.
    #[error("Envelope error: {0}")]
    Envelope(#[from] common::Error),

    /// Broker rejected or could not accept the operation.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Publish retries exhausted.
    #[error("Publish failed after {attempts} attempts: {last_error}")]
    PublishExhausted { attempts: u32, last_error: String },
}

pub type Result<T> = std::result::Result<T, BrokerError>;
