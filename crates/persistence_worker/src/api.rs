//! HTTP API handlers for the persistence worker.

use crate::store::MessageStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use broker::BrokerRouter;
use common::{Message, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Default page size for room history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on page size for room history.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub router: BrokerRouter,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rooms/{room_id}", get(get_room_handler))
        .route("/rooms/{room_id}/messages", get(list_messages_handler))
        .with_state(Arc::new(state))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    store: String,
    broker: String,
}

#[derive(Serialize)]
struct RoomResponse {
    room_id: String,
    participants: Vec<UserId>,
}

#[derive(Serialize)]
struct MessagesResponse {
    room_id: String,
    messages: Vec<Message>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_ok = state.store.ping().await.is_ok();
    let broker_ok = state.router.broker().health_check().await.is_ok();
    let status = if store_ok && broker_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if status == StatusCode::OK { "ok" } else { "degraded" }.to_string(),
            store: state.store.name().to_string(),
            broker: state.router.broker().name().to_string(),
        }),
    )
}

/// Participants of a room.
async fn get_room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let participants = state.store.participants(&room_id).await.map_err(|e| {
        error!("Failed to load room {}: {:?}", room_id, e);
        internal(e)
    })?;

    if participants.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: crate::error::Error::NotFound(room_id).to_string(),
            }),
        ));
    }

    Ok(Json(RoomResponse {
        room_id,
        participants,
    }))
}

/// Latest messages of a room, oldest first.
async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let messages = state.store.list_room(&room_id, limit).await.map_err(|e| {
        error!("Failed to list messages for room {}: {:?}", room_id, e);
        internal(e)
    })?;

    let count = messages.len();
    Ok(Json(MessagesResponse {
        room_id,
        messages,
        count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use broker::{InMemoryBroker, RetryPolicy};
    use common::MessageDraft;
    use uuid::Uuid;

    fn state(store: Arc<InMemoryMessageStore>) -> Arc<AppState> {
        Arc::new(AppState {
            store,
            router: BrokerRouter::new(Arc::new(InMemoryBroker::new()), RetryPolicy::default()),
        })
    }

    #[tokio::test]
    async fn test_history_and_room() {
        let store = Arc::new(InMemoryMessageStore::new());
        for i in 0..3 {
            let msg = Message::stamp(
                MessageDraft {
                    room_id: Some("general".to_string()),
                    receiver_id: None,
                    content: format!("m{}", i),
                    temp_id: None,
                },
                1,
                Uuid::new_v4(),
            );
            store.save("general", &msg).await.unwrap();
        }
        store.add_participants("general", &[1]).await.unwrap();

        let Json(page) = list_messages_handler(
            State(state(store.clone())),
            Path("general".to_string()),
            Query(HistoryQuery { limit: Some(2) }),
        )
        .await
        .unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.messages[1].content, "m2");

        let Json(room) = get_room_handler(State(state(store.clone())), Path("general".to_string()))
            .await
            .unwrap();
        assert_eq!(room.participants, vec![1]);

        let missing = get_room_handler(State(state(store)), Path("nowhere".to_string())).await;
        assert!(matches!(missing, Err((status, _)) if status == StatusCode::NOT_FOUND));
    }
}
