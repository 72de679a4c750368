//! Durable message store.
//!
//! Key layout (Redis):
//! - `message:{id}`: message JSON, written once
//! - `room:{room_id}:messages`: list of message ids in arrival order
//! - `room:{room_id}:members`: set of participant user ids

use crate::error::Result;
use async_trait::async_trait;
use common::{Message, MessageId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use redis::AsyncCommands;
use tracing::{debug, info};

/// Redis key prefix for messages: message:{id}
const MESSAGE_KEY_PREFIX: &str = "message:";

/// Redis key prefix for rooms: room:{room_id}:...
const ROOM_KEY_PREFIX: &str = "room:";

/// Stores the message and indexes it only if the id was not seen before.
const SAVE_ONCE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('RPUSH', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

/// Room a message is filed under. Direct messages get a stable pair room.
pub fn conversation_id(message: &Message) -> String {
    match (&message.room_id, message.receiver_id) {
        (Some(room_id), _) => room_id.clone(),
        (None, Some(receiver_id)) => {
            let (a, b) = if message.sender_id <= receiver_id {
                (message.sender_id, receiver_id)
            } else {
                (receiver_id, message.sender_id)
            };
            format!("dm:{}:{}", a, b)
        }
        (None, None) => format!("dm:{}", message.sender_id),
    }
}

fn message_key(id: MessageId) -> String {
    format!("{}{}", MESSAGE_KEY_PREFIX, id)
}

fn room_messages_key(room_id: &str) -> String {
    format!("{}{}:messages", ROOM_KEY_PREFIX, room_id)
}

fn room_members_key(room_id: &str) -> String {
    format!("{}{}:members", ROOM_KEY_PREFIX, room_id)
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write a message under a room. Returns false if the id was already stored.
    async fn save(&self, room_id: &str, message: &Message) -> Result<bool>;

    /// The latest `limit` messages of a room, oldest first.
    async fn list_room(&self, room_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn add_participants(&self, room_id: &str, users: &[UserId]) -> Result<()>;

    async fn participants(&self, room_id: &str) -> Result<Vec<UserId>>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed message store.
#[derive(Clone)]
pub struct RedisMessageStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisMessageStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis message store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn save(&self, room_id: &str, message: &Message) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(message)?;
        let inserted: i64 = redis::Script::new(SAVE_ONCE)
            .key(message_key(message.id()))
            .key(room_messages_key(room_id))
            .arg(json)
            .arg(message.id().to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn list_room(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let start = -(limit as isize);
        let ids: Vec<String> = conn.lrange(room_messages_key(room_id), start, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}{}", MESSAGE_KEY_PREFIX, id))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut messages = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            messages.push(serde_json::from_str(&json)?);
        }
        debug!("Loaded {} messages for room {}", messages.len(), room_id);
        Ok(messages)
    }

    async fn add_participants(&self, room_id: &str, users: &[UserId]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(room_members_key(room_id), users).await?;
        Ok(())
    }

    async fn participants(&self, room_id: &str) -> Result<Vec<UserId>> {
        let mut conn = self.conn.clone();
        let mut users: Vec<UserId> = conn.smembers(room_members_key(room_id)).await?;
        users.sort_unstable();
        Ok(users)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process message store for single-node runs and tests.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<MessageId, Message>,
    rooms: DashMap<String, Vec<MessageId>>,
    members: DashMap<String, DashSet<UserId>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, room_id: &str, message: &Message) -> Result<bool> {
        match self.messages.entry(message.id()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                self.rooms
                    .entry(room_id.to_string())
                    .or_default()
                    .push(message.id());
                Ok(true)
            }
        }
    }

    async fn list_room(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let ids = match self.rooms.get(room_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        let skip = ids.len().saturating_sub(limit);
        Ok(ids
            .iter()
            .skip(skip)
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .collect())
    }

    async fn add_participants(&self, room_id: &str, users: &[UserId]) -> Result<()> {
        let members = self.members.entry(room_id.to_string()).or_default();
        for user in users {
            members.insert(*user);
        }
        Ok(())
    }

    async fn participants(&self, room_id: &str) -> Result<Vec<UserId>> {
        let mut users: Vec<UserId> = self
            .members
            .get(room_id)
            .map(|set| set.iter().map(|u| *u).collect())
            .unwrap_or_default();
        users.sort_unstable();
        Ok(users)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MessageDraft;
    use uuid::Uuid;

    fn message(sender_id: UserId, receiver_id: Option<UserId>, room_id: Option<&str>, content: &str) -> Message {
        Message::stamp(
            MessageDraft {
                room_id: room_id.map(str::to_string),
                receiver_id,
                content: content.to_string(),
                temp_id: None,
            },
            sender_id,
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_conversation_id() {
        assert_eq!(conversation_id(&message(1, Some(2), Some("r1"), "x")), "r1");
        assert_eq!(conversation_id(&message(9, Some(2), None, "x")), "dm:2:9");
        assert_eq!(conversation_id(&message(2, Some(9), None, "x")), "dm:2:9");
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = InMemoryMessageStore::new();
        let msg = message(1, Some(2), None, "once");

        assert!(store.save("dm:1:2", &msg).await.unwrap());
        assert!(!store.save("dm:1:2", &msg).await.unwrap());

        assert_eq!(store.message_count(), 1);
        assert_eq!(store.list_room("dm:1:2", 50).await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_list_room_returns_latest_in_order() {
        let store = InMemoryMessageStore::new();
        let sent: Vec<Message> = (0..5)
            .map(|i| message(1, None, Some("general"), &format!("m{}", i)))
            .collect();
        for msg in &sent {
            store.save("general", msg).await.unwrap();
        }

        let latest = store.list_room("general", 2).await.unwrap();
        assert_eq!(latest, sent[3..].to_vec());
        assert!(store.list_room("elsewhere", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_participants() {
        let store = InMemoryMessageStore::new();
        store.add_participants("dm:1:2", &[2, 1]).await.unwrap();
        store.add_participants("dm:1:2", &[1]).await.unwrap();

        assert_eq!(store.participants("dm:1:2").await.unwrap(), vec![1, 2]);
        assert!(store.participants("none").await.unwrap().is_empty());
    }
}
