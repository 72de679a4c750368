//! Local fan-out: write a message to the connections this process holds.

use crate::protocol::ServerFrame;
use crate::registry::{Connection, ConnectionRegistry};
use common::{DeliveryTarget, Message};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one local fan-out attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Connections the message was addressed to on this instance.
    pub targets: usize,
    /// Writes that were queued.
    pub delivered: usize,
    /// Writes that hit a closed or saturated connection.
    pub failed: usize,
}

impl FanOutReport {
    pub fn hit(&self) -> bool {
        self.delivered > 0
    }
}

/// Local connections a message should be written to. Never the sending device.
pub fn local_targets(registry: &ConnectionRegistry, message: &Message) -> Vec<Arc<Connection>> {
    let connections = match message.delivery_target() {
        Some(DeliveryTarget::User(user_id)) => registry.connections_for_user(user_id),
        Some(DeliveryTarget::Room(room_id)) => registry.connections_for_room(&room_id),
        None => Vec::new(),
    };
    connections
        .into_iter()
        .filter(|connection| connection.id != message.sender_device)
        .collect()
}

/// Write `message` to every local target.
///
/// The copy written to clients is marked `delivered`; the caller's message is
/// left untouched so it can decide what status to record.
pub fn deliver_local(registry: &ConnectionRegistry, message: &Message) -> FanOutReport {
    let targets = local_targets(registry, message);
    let mut report = FanOutReport {
        targets: targets.len(),
        ..Default::default()
    };
    if targets.is_empty() {
        return report;
    }

    let mut delivered_copy = message.clone();
    delivered_copy.mark_delivered();

    // Serialize once for every device.
    let json = match serde_json::to_string(&ServerFrame::Message(delivered_copy.into())) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize message {}: {}", message.id(), e);
            report.failed = report.targets;
            return report;
        }
    };

    for connection in targets {
        match connection.send_text(json.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!("Live write of message {} failed: {}", message.id(), e);
            }
        }
    }

    counter!("gateway_local_deliveries_total").increment(report.delivered as u64);
    if report.failed > 0 {
        counter!("gateway_failed_writes_total").increment(report.failed as u64);
    }
    debug!(
        "Message {} fanned out to {}/{} local connections",
        message.id(),
        report.delivered,
        report.targets
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message as WsMessage;
    use common::MessageDraft;
    use tokio::sync::mpsc;

    fn connect(registry: &ConnectionRegistry, user_id: i64) -> (Arc<Connection>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let connection = Arc::new(Connection::new(user_id, tx));
        registry.add(connection.clone());
        (connection, rx)
    }

    fn message(sender: &Connection, receiver_id: Option<i64>, room_id: Option<&str>) -> Message {
        Message::stamp(
            MessageDraft {
                room_id: room_id.map(str::to_string),
                receiver_id,
                content: "hello".to_string(),
                temp_id: Some("tmp-9".to_string()),
            },
            sender.user_id,
            sender.id,
        )
    }

    fn received(rx: &mut mpsc::Receiver<WsMessage>) -> Option<serde_json::Value> {
        match rx.try_recv().ok()? {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }

    #[test]
    fn test_delivers_to_every_device_of_recipient() {
        let registry = ConnectionRegistry::new();
        let (alice, _a) = connect(&registry, 1);
        let (_phone, mut phone_rx) = connect(&registry, 2);
        let (_laptop, mut laptop_rx) = connect(&registry, 2);

        let msg = message(&alice, Some(2), None);
        let report = deliver_local(&registry, &msg);

        assert_eq!(report, FanOutReport { targets: 2, delivered: 2, failed: 0 });
        for rx in [&mut phone_rx, &mut laptop_rx] {
            let frame = received(rx).unwrap();
            assert_eq!(frame["type"], "message");
            assert_eq!(frame["status"], "delivered");
            assert_eq!(frame["id"], msg.id().to_string());
            assert!(frame.get("sender_device").is_none());
            assert!(frame.get("temp_id").is_none());
        }
        assert!(!msg.is_delivered());
    }

    #[test]
    fn test_sender_device_is_skipped() {
        let registry = ConnectionRegistry::new();
        let (phone, mut phone_rx) = connect(&registry, 1);
        let (_laptop, mut laptop_rx) = connect(&registry, 1);

        let report = deliver_local(&registry, &message(&phone, Some(1), None));

        assert_eq!(report.delivered, 1);
        assert!(received(&mut phone_rx).is_none());
        assert!(received(&mut laptop_rx).is_some());
    }

    #[test]
    fn test_room_target() {
        let registry = ConnectionRegistry::new();
        let (alice, _a) = connect(&registry, 1);
        let (bob, mut bob_rx) = connect(&registry, 2);
        let (_carol, mut carol_rx) = connect(&registry, 3);
        bob.join_room("general");

        let report = deliver_local(&registry, &message(&alice, None, Some("general")));

        assert!(report.hit());
        assert!(received(&mut bob_rx).is_some());
        assert!(received(&mut carol_rx).is_none());
    }

    #[test]
    fn test_closed_handles_fail_soft() {
        let registry = ConnectionRegistry::new();
        let (alice, _a) = connect(&registry, 1);
        let (_bob, bob_rx) = connect(&registry, 2);
        drop(bob_rx);

        let report = deliver_local(&registry, &message(&alice, Some(2), None));

        assert_eq!(report, FanOutReport { targets: 1, delivered: 0, failed: 1 });
        assert!(!report.hit());
    }

    #[test]
    fn test_no_local_targets() {
        let registry = ConnectionRegistry::new();
        let (alice, _a) = connect(&registry, 1);

        let report = deliver_local(&registry, &message(&alice, Some(42), None));
        assert_eq!(report, FanOutReport::default());
    }
}
