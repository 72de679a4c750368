//! Shared chat types for the delivery core.
//!
//! - [`Message`]: one chat event, stamped by the gateway that first accepts it
//! - [`RoutingEnvelope`]: a message plus the `persistence` / `broadcast`
//!   routing headers published to the broker

pub mod envelope;
pub mod error;
pub mod message;
pub mod subject;

pub use envelope::{
    RoutingEnvelope, RoutingHeaders, Subscription, BROADCAST_HEADER, CHAT_EVENTS_SUBJECT_PREFIX,
    ORIGIN_HEADER, PERSISTENCE_HEADER,
};
pub use error::{Error, Result};
pub use message::{
    ConnectionId, DeliveryTarget, Message, MessageDraft, MessageId, MessageStatus, UserId,
};
