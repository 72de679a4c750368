//! Broker routing layer for chat events.
//!
//! Publishes [`common::RoutingEnvelope`]s with bounded retry and drains the
//! two subscriptions bound to the chat events exchange:
//!
//! ```text
//!                      publish (persistence=true, broadcast=?)
//!                                   ↓
//!                           chat events exchange
//!                 ┌─────────────────┴──────────────────┐
//!     persistence=true                        broadcast=true
//!  (storage writer, shared)          (every gateway instance, own queue)
//! ```
//!
//! Backends: NATS JetStream for deployments, an in-process broker for
//! single-node runs and tests.

pub mod client;
pub mod error;
pub mod jetstream;
pub mod memory;
pub mod retry;
pub mod routing;
pub mod traits;

pub use client::{NatsClient, StreamConfig};
pub use error::{BrokerError, Result};
pub use jetstream::{JetStreamBroker, JetStreamConfig};
pub use memory::InMemoryBroker;
pub use retry::RetryPolicy;
pub use routing::{BrokerRouter, ConsumeStats};
pub use traits::{Acker, Broker, Delivery, DeliveryStream, EnvelopeHandler};
