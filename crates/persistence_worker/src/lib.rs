//! Persistence worker.
//!
//! Drains the shared `persistence` subscription into a message store. Every
//! envelope is written at most once per message id, so broker redeliveries
//! never create duplicate records. Exposes room history over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod store;
pub mod worker;

pub use api::{create_router, AppState};
pub use config::{StoreBackend, WorkerConfig};
pub use error::{Error, Result};
pub use store::{conversation_id, InMemoryMessageStore, MessageStore, RedisMessageStore};
pub use worker::PersistenceWorker;
