//! Connection state and the in-process connection registry.
//!
//! The registry owns every live connection handle. A primary map keyed by
//! connection id is the source of truth; the per-user device index is derived
//! from it and only ever changed under the same write lock. Lookups hand out
//! snapshots so no caller holds the lock across a socket write or an await.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerFrame;
use axum::extract::ws::Message as WsMessage;
use chrono::Utc;
use common::{ConnectionId, UserId};
use dashmap::DashSet;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default outbound buffer per connection, in frames.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// One live transport session.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    /// Writer side of the socket. Bounded so a slow client cannot grow memory.
    tx: mpsc::Sender<WsMessage>,
    rooms: DashSet<String>,
    last_seen: AtomicI64,
    close: Notify,
    /// Set once the registry dropped this connection. Ids are never re-registered.
    removed: AtomicBool,
}

impl Connection {
    /// Create a connection with a fresh id.
    pub fn new(user_id: UserId, tx: mpsc::Sender<WsMessage>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            user_id,
            tx,
            rooms: DashSet::new(),
            last_seen: AtomicI64::new(now),
            close: Notify::new(),
            removed: AtomicBool::new(false),
        }
    }

    /// Serialize and queue a frame.
    pub fn send(&self, frame: &ServerFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.send_text(json)
    }

    /// Queue pre-serialized text. Fails if the socket is gone or the buffer is full.
    pub fn send_text(&self, json: String) -> Result<()> {
        self.send_raw(WsMessage::Text(json.into()))
    }

    pub fn send_raw(&self, msg: WsMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|_| GatewayError::RegistryInconsistency(self.id))
    }

    /// Record client activity.
    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Last client activity, in epoch milliseconds.
    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn join_room(&self, room_id: &str) -> bool {
        self.rooms.insert(room_id.to_string())
    }

    pub fn leave_room(&self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }

    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    /// Ask the connection's read loop to shut down.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`Connection::request_close`] was called.
    pub async fn close_requested(&self) {
        self.close.notified().await;
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Registry of the connections held by this gateway process.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A duplicate or previously removed id is
    /// rejected and `false` returned.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.connections.contains_key(&connection.id) {
            warn!("Connection {} already registered, ignoring", connection.id);
            return false;
        }
        if connection.removed.load(Ordering::Acquire) {
            warn!("Connection {} was already removed, ignoring", connection.id);
            return false;
        }

        inner
            .by_user
            .entry(connection.user_id)
            .or_default()
            .insert(connection.id);
        info!(
            "Connection {} registered for user {}",
            connection.id, connection.user_id
        );
        inner.connections.insert(connection.id, connection);
        true
    }

    /// Remove a connection from both indexes. Idempotent.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let connection = inner.connections.remove(connection_id)?;
        connection.removed.store(true, Ordering::Release);

        if let Some(devices) = inner.by_user.get_mut(&connection.user_id) {
            devices.remove(connection_id);
            if devices.is_empty() {
                inner.by_user.remove(&connection.user_id);
            }
        }
        info!(
            "Connection {} unregistered for user {}",
            connection_id, connection.user_id
        );
        Some(connection)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.connections.get(connection_id).cloned()
    }

    /// Snapshot of a user's live devices.
    pub fn connections_for_user(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of connections that joined a room.
    pub fn connections_for_room(&self, room_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .connections
            .values()
            .filter(|connection| connection.in_room(room_id))
            .cloned()
            .collect()
    }

    pub fn join_room(&self, connection_id: &ConnectionId, room_id: &str) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or(GatewayError::ConnectionNotFound(*connection_id))?;
        if connection.join_room(room_id) {
            debug!("Connection {} joined room {}", connection_id, room_id);
        }
        Ok(())
    }

    pub fn leave_room(&self, connection_id: &ConnectionId, room_id: &str) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or(GatewayError::ConnectionNotFound(*connection_id))?;
        if connection.leave_room(room_id) {
            debug!("Connection {} left room {}", connection_id, room_id);
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.connections.len()
    }

    pub fn user_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_user.len()
    }

    /// Connections with no client activity for longer than `max_idle`.
    pub fn idle_connections(&self, max_idle: Duration) -> Vec<Arc<Connection>> {
        let cutoff = Utc::now().timestamp_millis() - max_idle.as_millis() as i64;
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .connections
            .values()
            .filter(|connection| connection.last_seen() < cutoff)
            .cloned()
            .collect()
    }

    /// Ask every live connection to close. Each one unregisters itself on teardown.
    pub fn close_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.connections.values().cloned().collect()
        };
        for connection in &connections {
            connection.request_close();
        }
        connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(user_id: UserId) -> (Arc<Connection>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (Arc::new(Connection::new(user_id, tx)), rx)
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx1) = connection(7);
        let (laptop, _rx2) = connection(7);

        assert!(registry.add(phone.clone()));
        assert!(registry.add(laptop.clone()));

        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.connections_for_user(7).len(), 2);
        assert!(registry.get(&phone.id).is_some());
        assert!(registry.connections_for_user(8).is_empty());
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1);

        assert!(registry.add(conn.clone()));
        assert!(!registry.add(conn.clone()));
        assert_eq!(registry.connections_for_user(1).len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_immediate() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1);
        registry.add(conn.clone());

        assert!(registry.remove(&conn.id).is_some());
        assert!(registry.get(&conn.id).is_none());
        assert!(registry.connections_for_user(1).is_empty());
        assert_eq!(registry.user_count(), 0);

        assert!(registry.remove(&conn.id).is_none());
    }

    #[test]
    fn test_removed_connection_cannot_be_re_added() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1);
        registry.add(conn.clone());
        registry.remove(&conn.id);

        assert!(!registry.add(conn.clone()));
        assert!(registry.get(&conn.id).is_none());
        assert!(registry.connections_for_user(1).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_removing_one_device_keeps_the_other() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx1) = connection(3);
        let (laptop, _rx2) = connection(3);
        registry.add(phone.clone());
        registry.add(laptop.clone());

        registry.remove(&phone.id);

        let left = registry.connections_for_user(3);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, laptop.id);
    }

    #[test]
    fn test_room_membership() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = connection(1);
        let (b, _rx2) = connection(2);
        registry.add(a.clone());
        registry.add(b.clone());

        registry.join_room(&a.id, "general").unwrap();
        registry.join_room(&b.id, "general").unwrap();
        registry.leave_room(&b.id, "general").unwrap();

        let members = registry.connections_for_room("general");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, a.id);

        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.join_room(&missing, "general"),
            Err(GatewayError::ConnectionNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_write_to_closed_handle_fails_soft() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = connection(1);
        registry.add(conn.clone());
        drop(rx);

        let snapshot = registry.connections_for_user(1);
        let err = snapshot[0].send(&ServerFrame::Pong).unwrap_err();
        assert!(matches!(err, GatewayError::RegistryInconsistency(id) if id == conn.id));
    }

    #[test]
    fn test_full_buffer_is_a_failed_write() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(1, tx);

        assert!(conn.send(&ServerFrame::Pong).is_ok());
        assert!(conn.send(&ServerFrame::Pong).is_err());
    }

    #[test]
    fn test_idle_connections() {
        let registry = ConnectionRegistry::new();
        let (stale, _rx1) = connection(1);
        let (fresh, _rx2) = connection(2);
        stale.last_seen.store(0, Ordering::Relaxed);
        registry.add(stale.clone());
        registry.add(fresh.clone());

        let idle = registry.idle_connections(Duration::from_secs(60));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, stale.id);
    }

    #[tokio::test]
    async fn test_close_all_signals_every_connection() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = connection(1);
        let (b, _rx2) = connection(2);
        registry.add(a.clone());
        registry.add(b.clone());

        assert_eq!(registry.close_all(), 2);

        tokio::time::timeout(Duration::from_millis(50), a.close_requested())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(50), b.close_requested())
            .await
            .unwrap();
    }
}
