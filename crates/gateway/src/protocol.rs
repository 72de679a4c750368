//! WebSocket protocol frame types.
//!
//! Defines the JSON frame format for client-server communication.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use common::{ConnectionId, Message, MessageId, MessageStatus, UserId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Frames
// ============================================================================

/// Chat message payload as sent by a client.
///
/// Every field is optional on the wire so that a missing field is reported
/// as a validation error instead of a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub content: Option<String>,
    /// Client correlation id, echoed back in the ack.
    #[serde(default, alias = "tempId")]
    pub temp_id: Option<String>,
}

/// Frame sent from client to server.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// Chat message. Frames without a `type` are treated as messages.
    Message(InboundMessage),
    /// Join a room to receive its messages.
    Join { room_id: String },
    /// Leave a room.
    Leave { room_id: String },
    /// Application-level keepalive.
    Ping,
}

#[derive(Deserialize)]
struct RoomFrame {
    room_id: String,
}

impl ClientFrame {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| GatewayError::Protocol("Invalid JSON format".to_string()))?;
        if !value.is_object() {
            return Err(GatewayError::Protocol("Invalid JSON format".to_string()));
        }

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("message")
            .to_string();

        match kind.as_str() {
            "message" => {
                let temp_id = raw_temp_id(&value);
                let inbound = serde_json::from_value(value).map_err(|e| GatewayError::MalformedMessage {
                    temp_id,
                    reason: format!("Invalid message frame: {}", e),
                })?;
                Ok(Self::Message(inbound))
            }
            "join" | "leave" => {
                let room: RoomFrame = serde_json::from_value(value).map_err(|_| {
                    GatewayError::Protocol(format!("'{}' frame requires room_id", kind))
                })?;
                if room.room_id.trim().is_empty() {
                    return Err(GatewayError::Protocol(format!(
                        "'{}' frame requires room_id",
                        kind
                    )));
                }
                Ok(if kind == "join" {
                    Self::Join {
                        room_id: room.room_id,
                    }
                } else {
                    Self::Leave {
                        room_id: room.room_id,
                    }
                })
            }
            "ping" => Ok(Self::Ping),
            other => Err(GatewayError::Protocol(format!(
                "Unknown frame type '{}'",
                other
            ))),
        }
    }
}

/// Client temp id of a frame that may not deserialize as a whole.
fn raw_temp_id(value: &serde_json::Value) -> Option<String> {
    value
        .get("temp_id")
        .or_else(|| value.get("tempId"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

// ============================================================================
// Server → Client Frames
// ============================================================================

/// Status carried by acknowledgement frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Connected,
    Sent,
    Error,
    ValidationError,
}

/// A message as its recipients see it.
///
/// Leaves out the sender's device and correlation id, which only mean
/// something to the sending connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredMessage {
    pub id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<Message> for DeliveredMessage {
    fn from(message: Message) -> Self {
        Self {
            id: message.id(),
            status: message.status(),
            room_id: message.room_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            created_at: message.created_at,
            updated_at: message.updated_at,
            deleted_at: message.deleted_at,
        }
    }
}

/// Frame sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once after a successful upgrade.
    Connection {
        connection_id: ConnectionId,
        user_id: UserId,
        message: String,
        status: AckStatus,
    },
    /// Outcome of a send. `id` echoes the client's temp id.
    Ack {
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        status: AckStatus,
        message: String,
    },
    ValidationError {
        id: Option<String>,
        errors: Vec<String>,
        status: AckStatus,
    },
    Error {
        id: Option<String>,
        message: String,
        status: AckStatus,
    },
    /// A chat message delivered live.
    Message(DeliveredMessage),
    Joined {
        room_id: String,
    },
    Left {
        room_id: String,
    },
    Pong,
}

impl ServerFrame {
    pub fn connected(connection_id: ConnectionId, user_id: UserId) -> Self {
        Self::Connection {
            connection_id,
            user_id,
            message: "Successfully connected".to_string(),
            status: AckStatus::Connected,
        }
    }

    pub fn sent(temp_id: Option<String>, message_id: MessageId) -> Self {
        Self::Ack {
            id: temp_id,
            message_id: Some(message_id),
            status: AckStatus::Sent,
            message: "Message sent successfully".to_string(),
        }
    }

    pub fn send_failed(temp_id: Option<String>, message_id: MessageId) -> Self {
        Self::Ack {
            id: temp_id,
            message_id: Some(message_id),
            status: AckStatus::Error,
            message: "Message could not be sent, please retry".to_string(),
        }
    }

    pub fn validation_error(temp_id: Option<String>, errors: Vec<String>) -> Self {
        Self::ValidationError {
            id: temp_id,
            errors,
            status: AckStatus::ValidationError,
        }
    }

    pub fn error(temp_id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id: temp_id,
            message: message.into(),
            status: AckStatus::Error,
        }
    }
}
