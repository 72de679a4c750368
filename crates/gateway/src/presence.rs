//! Presence tracking: a shared per-user connection counter.
//!
//! Key format: `connections:{user_id}`. The counter is incremented after a
//! connection is registered and decremented after it is removed. A key at or
//! below zero means offline and is deleted as best-effort cleanup.

use crate::error::Result;
use async_trait::async_trait;
use common::UserId;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Redis key prefix for presence counters: connections:{user_id}
const PRESENCE_KEY_PREFIX: &str = "connections:";

/// Deletes the key only if its value is still at or below zero, so a
/// concurrent reconnect that already incremented it is never wiped.
const DELETE_IF_NOT_POSITIVE: &str = r#"
local v = redis.call('GET', KEYS[1])
if v and tonumber(v) <= 0 then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub fn presence_key(user_id: UserId) -> String {
    format!("{}{}", PRESENCE_KEY_PREFIX, user_id)
}

/// Atomic counter store backing the tracker.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Increment and return the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Decrement and return the new value.
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Current value, 0 when the key is absent.
    async fn get(&self, key: &str) -> Result<i64>;

    /// Delete the key if it is still at or below zero. Returns whether it was deleted.
    async fn delete_if_not_positive(&self, key: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed presence store.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisPresenceStore {
    /// Open a multiplexed connection to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis presence store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.decr(key, 1).await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn delete_if_not_positive(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(DELETE_IF_NOT_POSITIVE)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process presence store for single-node runs and tests.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    counters: DashMap<String, i64>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key exists at all, including stale zero keys.
    pub fn contains_key(&self, key: &str) -> bool {
        self.counters.contains_key(key)
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry -= 1;
        Ok(*entry)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        Ok(self.counters.get(key).map(|v| *v).unwrap_or(0))
    }

    async fn delete_if_not_positive(&self, key: &str) -> Result<bool> {
        Ok(self.counters.remove_if(key, |_, v| *v <= 0).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Tracks whether users are reachable on any device of any gateway instance.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Count one more live connection for the user.
    pub async fn mark_online(&self, user_id: UserId) -> Result<i64> {
        let count = self.store.incr(&presence_key(user_id)).await?;
        debug!("User {} online ({} connections)", user_id, count);
        Ok(count)
    }

    /// Count one connection less. Deletes the key once it reaches zero.
    pub async fn mark_offline(&self, user_id: UserId) -> Result<i64> {
        let key = presence_key(user_id);
        let count = self.store.decr(&key).await?;
        if count < 0 {
            warn!("Presence counter for user {} went negative ({})", user_id, count);
        }
        if count <= 0 {
            // A stale zero key still reads as offline.
            if let Err(e) = self.store.delete_if_not_positive(&key).await {
                warn!("Failed to clear presence key {}: {}", key, e);
            }
            debug!("User {} offline", user_id);
        }
        Ok(count)
    }

    /// Read straight from the store.
    pub async fn is_online(&self, user_id: UserId) -> Result<bool> {
        let count = self.store.get(&presence_key(user_id)).await?;
        Ok(count > 0)
    }
}
