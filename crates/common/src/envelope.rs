//! Routing envelope: the unit published to the broker.
//!
//! A single publish is routed to zero, one or both subscriptions by two
//! independent header flags. The flags are carried twice:
//!
//! ```text
//! headers: persistence: true, broadcast: true|false, origin: <instance id>
//! subject: chat.events.p{0|1}.b{0|1}
//! ```
//!
//! Brokers that match on headers use the former; brokers that only filter on
//! subjects (JetStream consumers) use the latter. Both are derived from the
//! same [`RoutingHeaders`] value. `origin` names the gateway instance that
//! published the envelope and does not take part in routing.

use crate::error::{Error, Result};
use crate::message::Message;
use serde::{Deserialize, Serialize};

/// Subject prefix for every chat event.
pub const CHAT_EVENTS_SUBJECT_PREFIX: &str = "chat.events";

/// Header name for the persistence flag.
pub const PERSISTENCE_HEADER: &str = "persistence";

/// Header name for the broadcast flag.
pub const BROADCAST_HEADER: &str = "broadcast";

/// Header name for the publishing instance.
pub const ORIGIN_HEADER: &str = "origin";

/// Routing flags attached to every published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeaders {
    persistence: bool,
    broadcast: bool,
}

impl RoutingHeaders {
    /// Persistence is always requested; broadcast is the caller's decision.
    pub fn new(broadcast: bool) -> Self {
        Self {
            persistence: true,
            broadcast,
        }
    }

    pub fn persistence(&self) -> bool {
        self.persistence
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    /// Publish subject encoding both flags.
    pub fn subject(&self) -> String {
        format!(
            "{}.p{}.b{}",
            CHAT_EVENTS_SUBJECT_PREFIX,
            u8::from(self.persistence),
            u8::from(self.broadcast)
        )
    }

    /// Header name/value pairs for brokers with header support.
    pub fn to_pairs(&self) -> [(&'static str, &'static str); 2] {
        [
            (PERSISTENCE_HEADER, bool_str(self.persistence)),
            (BROADCAST_HEADER, bool_str(self.broadcast)),
        ]
    }

    /// Parse header values as received from the broker.
    ///
    /// `persistence` must be present; a missing `broadcast` reads as false.
    pub fn from_values(persistence: Option<&str>, broadcast: Option<&str>) -> Result<Self> {
        let persistence = persistence.ok_or(Error::MissingHeader(PERSISTENCE_HEADER))?;
        Ok(Self {
            persistence: parse_bool(PERSISTENCE_HEADER, persistence)?,
            broadcast: broadcast
                .map(|value| parse_bool(BROADCAST_HEADER, value))
                .transpose()?
                .unwrap_or(false),
        })
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::InvalidHeader {
            name,
            value: other.to_string(),
        }),
    }
}

/// The two independent consumers of published envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Every message, consumed by the storage writer.
    Persistence,
    /// Messages re-offered for live delivery on every gateway instance.
    Broadcast,
}

impl Subscription {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Persistence => "persistence",
            Self::Broadcast => "broadcast",
        }
    }

    /// Header match rule.
    pub fn matches(&self, headers: &RoutingHeaders) -> bool {
        match self {
            Self::Persistence => headers.persistence,
            Self::Broadcast => headers.broadcast,
        }
    }

    /// Subject filter equivalent to [`Subscription::matches`].
    pub fn filter_subject(&self) -> String {
        match self {
            Self::Persistence => format!("{}.p1.*", CHAT_EVENTS_SUBJECT_PREFIX),
            Self::Broadcast => format!("{}.*.b1", CHAT_EVENTS_SUBJECT_PREFIX),
        }
    }
}

/// A message together with its routing headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEnvelope {
    pub headers: RoutingHeaders,
    pub message: Message,
    /// Instance that published the envelope, when known.
    pub origin: Option<String>,
}

impl RoutingEnvelope {
    pub fn new(message: Message, broadcast: bool) -> Self {
        Self {
            headers: RoutingHeaders::new(broadcast),
            message,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Whether `instance_id` published this envelope.
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.origin.as_deref() == Some(instance_id)
    }

    pub fn subject(&self) -> String {
        self.headers.subject()
    }

    /// Every header to attach on publish, routing flags first.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs: Vec<(&'static str, String)> = self
            .headers
            .to_pairs()
            .iter()
            .map(|(name, value)| (*name, value.to_string()))
            .collect();
        if let Some(origin) = &self.origin {
            pairs.push((ORIGIN_HEADER, origin.clone()));
        }
        pairs
    }

    /// Serialized message body. Headers travel out of band.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.message)?)
    }

    pub fn decode(headers: RoutingHeaders, origin: Option<&str>, payload: &[u8]) -> Result<Self> {
        let message: Message = serde_json::from_slice(payload)?;
        Ok(Self {
            headers,
            message,
            origin: origin.map(str::to_string),
        })
    }
}
