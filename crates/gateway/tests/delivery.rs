//! End-to-end delivery scenarios over real WebSocket connections.
//!
//! Each gateway runs a real axum server on an ephemeral port, backed by the
//! in-process broker and presence store. Gateways sharing a broker behave
//! like separate instances of one deployment.

use broker::{Broker, DeliveryStream, InMemoryBroker};
use common::Subscription;
use futures::{SinkExt, StreamExt};
use gateway::{build, create_router, AppState, GatewayConfig, InMemoryPresenceStore, PresenceStore};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

struct TestGateway {
    addr: SocketAddr,
    state: Arc<AppState>,
    _consumer_shutdown: mpsc::Sender<()>,
}

async fn spawn_gateway(broker: Arc<InMemoryBroker>, presence: Arc<dyn PresenceStore>) -> TestGateway {
    let mut config = GatewayConfig::default();
    config.retry = broker::RetryPolicy::new(2, Duration::from_millis(1));

    let gateway = build(&config, broker, presence).unwrap();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(gateway.consumer.clone().run(shutdown_rx));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(gateway.state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    // Let the broadcast consumer bind its subscription.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestGateway {
        addr,
        state: gateway.state,
        _consumer_shutdown: shutdown_tx,
    }
}

async fn connect(gateway: &TestGateway, user_id: i64) -> (Client, Value) {
    let url = format!("ws://{}/ws?user_id={}", gateway.addr, user_id);
    let (mut client, _) = connect_async(url).await.unwrap();
    let greeting = next_json(&mut client).await.expect("connection frame");
    (client, greeting)
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next()).await.ok()??.ok()?;
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).ok();
        }
    }
}

/// Assert no text frame arrives within a short window.
async fn assert_silent(client: &mut Client) {
    let waited = tokio::time::timeout(Duration::from_millis(150), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.as_str().to_string()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = waited {
        panic!("unexpected frame: {}", text);
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

async fn next_delivery(stream: &mut DeliveryStream) -> broker::Delivery {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("delivery in time")
        .expect("stream open")
        .expect("delivery")
}

fn memory_presence() -> Arc<dyn PresenceStore> {
    Arc::new(InMemoryPresenceStore::new())
}

#[tokio::test]
async fn test_connection_frame() {
    let gateway = spawn_gateway(Arc::new(InMemoryBroker::new()), memory_presence()).await;
    let (_client, greeting) = connect(&gateway, 7).await;

    assert_eq!(greeting["type"], "connection");
    assert_eq!(greeting["user_id"], 7);
    assert_eq!(greeting["status"], "connected");
    assert_eq!(greeting["message"], "Successfully connected");
    assert!(greeting["connection_id"].is_string());

    assert!(gateway.state.presence.is_online(7).await.unwrap());
    assert_eq!(gateway.state.registry.connection_count(), 1);
}

#[tokio::test]
async fn test_upgrade_without_identity_is_rejected() {
    let gateway = spawn_gateway(Arc::new(InMemoryBroker::new()), memory_presence()).await;
    let url = format!("ws://{}/ws", gateway.addr);

    assert!(connect_async(url).await.is_err());
    assert_eq!(gateway.state.registry.connection_count(), 0);
}

#[tokio::test]
async fn test_offline_recipient() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut persistence = broker.subscribe(Subscription::Persistence).await.unwrap();
    let gateway = spawn_gateway(broker.clone(), memory_presence()).await;
    let (mut alice, _) = connect(&gateway, 1).await;

    send(&mut alice, json!({ "receiver_id": 2, "content": "are you there?", "temp_id": "t-1" })).await;

    let ack = next_json(&mut alice).await.unwrap();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["status"], "sent");
    assert_eq!(ack["id"], "t-1");

    let delivery = next_delivery(&mut persistence).await;
    let envelope = delivery.envelope().unwrap();
    assert!(envelope.headers.persistence());
    assert!(envelope.headers.broadcast());
    assert_eq!(envelope.message.status().as_str(), "pending");
    assert_eq!(envelope.message.content, "are you there?");
    assert_eq!(ack["message_id"], envelope.message.id().to_string());

    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_local_recipient() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut persistence = broker.subscribe(Subscription::Persistence).await.unwrap();
    let gateway = spawn_gateway(broker.clone(), memory_presence()).await;
    let (mut alice, _) = connect(&gateway, 1).await;
    let (mut bob, _) = connect(&gateway, 2).await;

    send(&mut alice, json!({ "receiver_id": 2, "content": "hi bob" })).await;

    let delivered = next_json(&mut bob).await.unwrap();
    assert_eq!(delivered["type"], "message");
    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["sender_id"], 1);
    assert_eq!(delivered["content"], "hi bob");

    let ack = next_json(&mut alice).await.unwrap();
    assert_eq!(ack["status"], "sent");

    let envelope = next_delivery(&mut persistence).await;
    let envelope = envelope.envelope().unwrap();
    assert!(!envelope.headers.broadcast());
    assert!(envelope.message.is_delivered());

    // Delivered once, not again through broadcast.
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_cross_instance_recipient() {
    let broker = Arc::new(InMemoryBroker::new());
    let presence = memory_presence();
    let instance_1 = spawn_gateway(broker.clone(), presence.clone()).await;
    let instance_2 = spawn_gateway(broker.clone(), presence.clone()).await;

    let (mut alice, _) = connect(&instance_1, 1).await;
    let (mut bob, _) = connect(&instance_2, 2).await;

    send(&mut alice, json!({ "receiver_id": 2, "content": "across the cluster" })).await;

    let ack = next_json(&mut alice).await.unwrap();
    assert_eq!(ack["status"], "sent");

    let delivered = next_json(&mut bob).await.unwrap();
    assert_eq!(delivered["type"], "message");
    assert_eq!(delivered["content"], "across the cluster");
    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["id"], ack["message_id"]);

    // Neither the sender nor a second copy.
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_room_message_reaches_members_on_other_instances() {
    let broker = Arc::new(InMemoryBroker::new());
    let presence = memory_presence();
    let instance_1 = spawn_gateway(broker.clone(), presence.clone()).await;
    let instance_2 = spawn_gateway(broker.clone(), presence.clone()).await;

    let (mut alice, _) = connect(&instance_1, 1).await;
    let (mut carol, _) = connect(&instance_2, 3).await;

    send(&mut carol, json!({ "type": "join", "room_id": "general" })).await;
    assert_eq!(next_json(&mut carol).await.unwrap()["type"], "joined");

    send(&mut alice, json!({ "room_id": "general", "content": "hello room" })).await;
    assert_eq!(next_json(&mut alice).await.unwrap()["status"], "sent");

    let delivered = next_json(&mut carol).await.unwrap();
    assert_eq!(delivered["room_id"], "general");
    assert_eq!(delivered["content"], "hello room");
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let broker = Arc::new(InMemoryBroker::new());
    let gateway = spawn_gateway(broker.clone(), memory_presence()).await;
    let (mut alice, _) = connect(&gateway, 1).await;

    send(&mut alice, json!({ "receiver_id": 2, "temp_id": "t-9" })).await;
    let rejected = next_json(&mut alice).await.unwrap();
    assert_eq!(rejected["type"], "validation_error");
    assert_eq!(rejected["status"], "validation_error");
    assert_eq!(rejected["id"], "t-9");
    assert_eq!(rejected["errors"], json!(["Field 'content' is invalid: required"]));

    alice.send(Message::text("{not json")).await.unwrap();
    let error = next_json(&mut alice).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Invalid JSON format");
    assert!(error["id"].is_null());

    send(&mut alice, json!({ "content": 5, "receiver_id": 2, "temp_id": "t-10" })).await;
    let error = next_json(&mut alice).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "t-10");

    assert_eq!(broker.published_count(), 0);

    send(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut alice).await.unwrap()["type"], "pong");
}

#[tokio::test]
async fn test_publish_failure_reports_error_ack() {
    let broker = Arc::new(InMemoryBroker::new());
    let gateway = spawn_gateway(broker.clone(), memory_presence()).await;
    let (mut alice, _) = connect(&gateway, 1).await;
    broker.inject_publish_failures(10);

    send(&mut alice, json!({ "receiver_id": 2, "content": "lost?", "temp_id": "t-2" })).await;

    let ack = next_json(&mut alice).await.unwrap();
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["status"], "error");
    assert_eq!(ack["id"], "t-2");

    // The connection survives the failure.
    send(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut alice).await.unwrap()["type"], "pong");
}

#[tokio::test]
async fn test_presence_follows_last_device() {
    let gateway = spawn_gateway(Arc::new(InMemoryBroker::new()), memory_presence()).await;
    let (mut phone, _) = connect(&gateway, 5).await;
    let (mut laptop, _) = connect(&gateway, 5).await;
    assert_eq!(gateway.state.registry.connections_for_user(5).len(), 2);

    phone.close(None).await.unwrap();
    wait_for(|| gateway.state.registry.connections_for_user(5).len() == 1).await;
    assert!(gateway.state.presence.is_online(5).await.unwrap());

    laptop.close(None).await.unwrap();
    wait_for(|| gateway.state.registry.connections_for_user(5).is_empty()).await;

    let mut online = true;
    for _ in 0..40 {
        online = gateway.state.presence.is_online(5).await.unwrap();
        if !online {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!online);
}

#[tokio::test]
async fn test_close_all_tears_down_connections() {
    let gateway = spawn_gateway(Arc::new(InMemoryBroker::new()), memory_presence()).await;
    let (mut client, _) = connect(&gateway, 8).await;

    assert_eq!(gateway.state.registry.close_all(), 1);

    wait_for(|| gateway.state.registry.connection_count() == 0).await;
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..80 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met in time");
}
