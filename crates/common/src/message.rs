//! Chat message model.
//!
//! A [`Message`] is created in memory by the gateway that first accepts it.
//! The gateway assigns the id and creation timestamp; clients never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identity, as issued by the auth service.
pub type UserId = i64;

/// Per-connection identifier, generated at accept time.
pub type ConnectionId = Uuid;

/// Globally unique message identifier.
pub type MessageId = Uuid;

/// Delivery status of a message.
///
/// Ordered so that a transition is valid only if it does not decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Accepted, no live delivery observed yet.
    Pending,
    /// Written to at least one live connection of the recipient.
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
        }
    }
}

/// Validated client input, before the gateway stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub room_id: Option<String>,
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub temp_id: Option<String>,
}

/// Who a message should be delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryTarget {
    /// Every device of one user.
    User(UserId),
    /// Every connection that joined a room.
    Room(String),
}

/// One chat event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Connection that sent the message. Never echoed back to it.
    pub sender_device: ConnectionId,
    /// Client-local correlation id, echoed in the ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl Message {
    /// Stamp a validated draft with a fresh id and creation time.
    pub fn stamp(draft: MessageDraft, sender_id: UserId, sender_device: ConnectionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: draft.room_id,
            sender_id,
            receiver_id: draft.receiver_id,
            content: draft.content,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            sender_device,
            temp_id: draft.temp_id,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn is_delivered(&self) -> bool {
        self.status == MessageStatus::Delivered
    }

    /// Move `pending → delivered`. Returns false if already delivered.
    pub fn mark_delivered(&mut self) -> bool {
        if self.status >= MessageStatus::Delivered {
            return false;
        }
        self.status = MessageStatus::Delivered;
        self.updated_at = Some(Utc::now());
        true
    }

    /// Direct addressing wins over the room when both are present.
    pub fn delivery_target(&self) -> Option<DeliveryTarget> {
        match (self.receiver_id, &self.room_id) {
            (Some(user_id), _) => Some(DeliveryTarget::User(user_id)),
            (None, Some(room_id)) => Some(DeliveryTarget::Room(room_id.clone())),
            (None, None) => None,
        }
    }
}
