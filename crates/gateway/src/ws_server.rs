//! WebSocket server handler using Axum.

use crate::auth::{ConnectQuery, IdentityResolver};
use crate::config::ConnectionSettings;
use crate::error::{GatewayError, Result};
use crate::pipeline::DeliveryPipeline;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::{Connection, ConnectionRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use broker::BrokerRouter;
use common::UserId;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// How long teardown waits for queued frames to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for connections to finish teardown at shutdown.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceTracker,
    pub pipeline: Arc<DeliveryPipeline>,
    pub identity: IdentityResolver,
    pub router: BrokerRouter,
    pub instance_id: String,
    pub settings: ConnectionSettings,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence/{user_id}", get(presence_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker_ok = state.router.broker().health_check().await.is_ok();
    let presence_ok = state.presence.store().ping().await.is_ok();
    let status = if broker_ok && presence_ok { "ok" } else { "degraded" };

    Json(json!({
        "status": status,
        "instance_id": state.instance_id,
        "connections": state.registry.connection_count(),
        "users": state.registry.user_count(),
        "broker": state.router.broker().name(),
        "broker_ok": broker_ok,
        "presence_ok": presence_ok,
    }))
}

async fn presence_handler(
    Path(user_id): Path<UserId>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.presence.is_online(user_id).await {
        Ok(online) => Json(json!({ "user_id": user_id, "online": online })).into_response(),
        Err(e) => {
            warn!("Presence lookup for user {} failed: {}", user_id, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "presence store unavailable" })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler. Identity is settled before the upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = match state.identity.resolve(&query) {
        Ok(user_id) => user_id,
        Err(e) => {
            counter!("gateway_unauthorized_total").increment(1);
            info!("Rejected upgrade: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded so a client that stops reading cannot grow memory.
    let (tx, mut rx) = mpsc::channel::<Message>(state.settings.client_buffer_size);

    let connection = Arc::new(Connection::new(user_id, tx));
    let connection_id = connection.id;
    if !state.registry.add(connection.clone()) {
        return;
    }
    if let Err(e) = state.presence.mark_online(user_id).await {
        warn!("Failed to mark user {} online: {}", user_id, e);
    }

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);

    info!("Connection {} opened for user {}", connection_id, user_id);

    if let Err(e) = connection.send(&ServerFrame::connected(connection_id, user_id)) {
        warn!("Failed to greet {}: {}", connection_id, e);
    }

    // Forward queued frames to the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let period = state.settings.ping_interval;
    let mut ping_interval = interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = connection.close_requested() => {
                debug!("Closing connection {} on request", connection_id);
                let _ = connection.send_raw(Message::Close(None));
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        connection.touch();
                        if !handle_message(&state, &connection, msg).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Connection {}: {}", connection_id, GatewayError::Transport(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if connection.send_raw(Message::Ping(Vec::new().into())).is_err() {
                    warn!("Connection {} is not draining its buffer, closing", connection_id);
                    break;
                }
            }
        }
    }

    // Registry removal precedes the presence decrement.
    state.registry.remove(&connection_id);
    if let Err(e) = state.presence.mark_offline(user_id).await {
        warn!("Failed to mark user {} offline: {}", user_id, e);
    }

    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);

    info!("Connection {} closed for user {}", connection_id, user_id);
}

/// Handle one WebSocket frame. Returns false when the connection should close.
async fn handle_message(state: &Arc<AppState>, connection: &Arc<Connection>, msg: Message) -> bool {
    let result = match msg {
        Message::Text(text) => handle_text(state, connection, text.as_str()).await,
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => handle_text(state, connection, text).await,
            Err(_) => Err(GatewayError::Protocol("Invalid JSON format".to_string())),
        },
        // The transport answers pings itself.
        Message::Ping(_) | Message::Pong(_) => Ok(()),
        Message::Close(_) => return false,
    };

    if let Err(e) = result {
        warn!("Error handling frame from {}: {}", connection.id, e);
        let frame = match e {
            GatewayError::Protocol(message) => ServerFrame::error(None, message),
            GatewayError::MalformedMessage { temp_id, reason } => ServerFrame::error(temp_id, reason),
            other => ServerFrame::error(None, other.to_string()),
        };
        if connection.send(&frame).is_err() {
            debug!("Could not report error to {}", connection.id);
        }
    }
    true
}

/// Handle a text frame.
async fn handle_text(state: &Arc<AppState>, connection: &Arc<Connection>, text: &str) -> Result<()> {
    match ClientFrame::parse(text)? {
        ClientFrame::Message(inbound) => {
            state.pipeline.process(connection, inbound).await;
            Ok(())
        }
        ClientFrame::Join { room_id } => {
            state.registry.join_room(&connection.id, &room_id)?;
            connection.send(&ServerFrame::Joined { room_id })
        }
        ClientFrame::Leave { room_id } => {
            state.registry.leave_room(&connection.id, &room_id)?;
            connection.send(&ServerFrame::Left { room_id })
        }
        ClientFrame::Ping => connection.send(&ServerFrame::Pong),
    }
}

/// Close connections that have been silent longer than the idle timeout.
pub async fn run_idle_reaper(
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval((idle_timeout / 2).max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            _ = ticker.tick() => {
                for connection in registry.idle_connections(idle_timeout) {
                    warn!("Closing idle connection {} (user {})", connection.id, connection.user_id);
                    counter!("gateway_idle_closed_total").increment(1);
                    connection.request_close();
                }
            }
        }
    }
    debug!("Idle reaper stopped");
}

/// Close every registered connection and wait for the registry to empty.
///
/// Runs after the listener stopped accepting. Close requests are re-sent on
/// every poll so upgrades that completed late are closed too. Returns the
/// number of connections still open when `timeout` expires.
pub async fn drain_connections(registry: &ConnectionRegistry, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let initial = registry.close_all();
    if initial > 0 {
        info!("Closing {} connections", initial);
    }

    loop {
        if registry.connection_count() == 0 {
            return 0;
        }
        if Instant::now() >= deadline {
            return registry.connection_count();
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        registry.close_all();
    }
}
