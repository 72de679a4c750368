//! Persistence worker configuration, read from the environment.

use crate::error::{Error, Result};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Redis { url: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub nats_url: String,
    pub store: StoreBackend,
    pub instance_id: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let nats_url = broker_url(&env_string("BROKER_BACKEND", "jetstream"))?;

        let store = match env_string("STORE_BACKEND", "redis").as_str() {
            "redis" => StoreBackend::Redis {
                url: env_string("REDIS_URL", "redis://localhost:6379"),
            },
            "memory" => StoreBackend::Memory,
            other => {
                return Err(Error::Config(format!(
                    "STORE_BACKEND must be 'redis' or 'memory', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            http_port: env_port("HTTP_PORT", 8082)?,
            metrics_port: env_port("METRICS_PORT", 9094)?,
            nats_url,
            store,
            instance_id: env_string("INSTANCE_ID", "persistence-worker"),
        })
    }
}

/// The worker runs in its own process, so only a networked broker can reach it.
fn broker_url(backend: &str) -> Result<String> {
    match backend {
        "jetstream" | "nats" => Ok(env_string("NATS_URL", "nats://localhost:4222")),
        "memory" => Err(Error::Config(
            "BROKER_BACKEND=memory only connects components inside one process; \
             the persistence worker needs 'jetstream'"
                .to_string(),
        )),
        other => Err(Error::Config(format!(
            "BROKER_BACKEND must be 'jetstream', got '{}'",
            other
        ))),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_port(key: &str, default: u16) -> Result<u16> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} must be a port number, got '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}
