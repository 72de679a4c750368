//! Chat delivery gateway.
//!
//! This service:
//! - Accepts WebSocket connections from authenticated chat clients
//! - Tracks per-user presence in a shared counter store
//! - Validates, stamps and fans out messages to locally held connections
//! - Publishes every message for persistence, and for broadcast when the
//!   recipient was not reached here
//! - Drains its own broadcast subscription into local connections
//!
//! ## Architecture
//!
//! ```text
//! client ─▶ ws_server ─▶ DeliveryPipeline ─┬─▶ local fan-out (ConnectionRegistry)
//!                                          └─▶ BrokerRouter.publish
//!                                                  │
//!                       chat.events.*.b1 ◀─────────┤
//!                              │                   └──▶ chat.events.p1.* (persistence worker)
//!                              ▼
//!                      BroadcastConsumer ─▶ ConnectionRegistry ─▶ WebSocket clients
//! ```

pub mod app;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod fanout;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod ws_server;

pub use app::{build, connect_broker, connect_presence, Gateway};
pub use auth::{Claims, ConnectQuery, IdentityResolver, TokenVerifier};
pub use broadcast::BroadcastConsumer;
pub use config::{GatewayConfig, PipelineConfig};
pub use error::{GatewayError, Result};
pub use pipeline::{DeliveryPipeline, PipelineOutcome};
pub use presence::{InMemoryPresenceStore, PresenceStore, PresenceTracker, RedisPresenceStore};
pub use protocol::{ClientFrame, InboundMessage, ServerFrame};
pub use registry::{Connection, ConnectionRegistry};
pub use ws_server::{create_router, drain_connections, run_idle_reaper, AppState};
