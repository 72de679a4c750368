//! Gateway configuration, read from the environment.

use crate::error::{GatewayError, Result};
use broker::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Which message-queue backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerBackend {
    /// NATS JetStream at the given URL.
    JetStream { url: String },
    /// In-process broker (single instance only).
    Memory,
}

/// Which presence store to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceBackend {
    /// Redis at the given URL.
    Redis { url: String },
    /// In-process counters (single instance only).
    Memory,
}

/// How tokens presented on upgrade are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKey {
    /// HS256 shared secret.
    Secret(String),
    /// RS256 public key, PEM file path.
    PublicKeyPath(String),
}

/// Delivery pipeline policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum message content length, in characters.
    pub max_content_length: usize,
    /// Set `broadcast` for recipients the presence store reports offline.
    pub broadcast_when_offline: bool,
    /// Set `broadcast` even after a local delivery hit.
    pub broadcast_after_local_hit: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_content_length: 4096,
            broadcast_when_offline: true,
            broadcast_after_local_hit: false,
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Connections silent for longer than this are closed.
    pub idle_timeout: Duration,
    /// Outbound frame buffer per connection.
    pub client_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            client_buffer_size: crate::registry::CLIENT_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    /// Identity of this gateway process among its peers.
    pub instance_id: String,
    pub broker: BrokerBackend,
    pub presence: PresenceBackend,
    pub token_key: Option<TokenKey>,
    /// Accept `?user_id=` when a fronting layer already authenticated the request.
    pub trust_user_id_param: bool,
    pub retry: RetryPolicy,
    pub pipeline: PipelineConfig,
    pub connection: ConnectionSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8081,
            metrics_port: 9093,
            instance_id: format!("gw-{}", Uuid::new_v4().simple()),
            broker: BrokerBackend::Memory,
            presence: PresenceBackend::Memory,
            token_key: None,
            trust_user_id_param: true,
            retry: RetryPolicy::default(),
            pipeline: PipelineConfig::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let broker = match env_string("BROKER_BACKEND", "jetstream").as_str() {
            "jetstream" | "nats" => BrokerBackend::JetStream {
                url: env_string("NATS_URL", "nats://localhost:4222"),
            },
            "memory" => BrokerBackend::Memory,
            other => {
                return Err(GatewayError::Config(format!(
                    "BROKER_BACKEND must be 'jetstream' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let presence = match env_string("PRESENCE_BACKEND", "redis").as_str() {
            "redis" => PresenceBackend::Redis {
                url: env_string("REDIS_URL", "redis://localhost:6379"),
            },
            "memory" => PresenceBackend::Memory,
            other => {
                return Err(GatewayError::Config(format!(
                    "PRESENCE_BACKEND must be 'redis' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let token_key = match (env::var("JWT_SECRET").ok(), env::var("JWT_PUBLIC_KEY_PATH").ok()) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::Config(
                    "set only one of JWT_SECRET and JWT_PUBLIC_KEY_PATH".to_string(),
                ))
            }
            (Some(secret), None) => Some(TokenKey::Secret(secret)),
            (None, Some(path)) => Some(TokenKey::PublicKeyPath(path)),
            (None, None) => None,
        };

        let trust_user_id_param = env_parse("TRUST_USER_ID_PARAM", token_key.is_none())?;
        if token_key.is_none() && !trust_user_id_param {
            return Err(GatewayError::Config(
                "no way to identify users: set JWT_SECRET, JWT_PUBLIC_KEY_PATH or TRUST_USER_ID_PARAM=true"
                    .to_string(),
            ));
        }

        let retry = RetryPolicy::new(
            env_parse("PUBLISH_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            Duration::from_millis(env_parse(
                "PUBLISH_RETRY_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
        );

        let pipeline = PipelineConfig {
            max_content_length: env_parse(
                "MAX_CONTENT_LENGTH",
                defaults.pipeline.max_content_length,
            )?,
            broadcast_when_offline: env_parse(
                "BROADCAST_WHEN_OFFLINE",
                defaults.pipeline.broadcast_when_offline,
            )?,
            broadcast_after_local_hit: env_parse(
                "BROADCAST_AFTER_LOCAL_HIT",
                defaults.pipeline.broadcast_after_local_hit,
            )?,
        };

        let connection = ConnectionSettings {
            ping_interval: Duration::from_secs(env_parse(
                "PING_INTERVAL_SECS",
                defaults.connection.ping_interval.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(env_parse(
                "IDLE_TIMEOUT_SECS",
                defaults.connection.idle_timeout.as_secs(),
            )?),
            client_buffer_size: env_parse(
                "CLIENT_BUFFER_SIZE",
                defaults.connection.client_buffer_size,
            )?,
        };
        if connection.client_buffer_size == 0 {
            return Err(GatewayError::Config(
                "CLIENT_BUFFER_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            http_port: env_parse("HTTP_PORT", defaults.http_port)?,
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port)?,
            instance_id: env::var("INSTANCE_ID").unwrap_or(defaults.instance_id),
            broker,
            presence,
            token_key,
            trust_user_id_param,
            retry,
            pipeline,
            connection,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("{} must be a valid value ({}): {}", key, raw, e)))
}
