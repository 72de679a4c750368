//! Error types for the persistence worker.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Room not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
