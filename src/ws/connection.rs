//! WebSocket connection state machine.
//!
//! Handles the read/write loop for a single WebSocket connection,
//! dispatching incoming commands and forwarding filtered snapshots.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::messages::{WsCommand, WsMessage, WsMessageType};
use super::subscription::{RoomFilter, SubscriptionManager};
use crate::domain::{RoomId, RoomSnapshot};
use crate::service::SnapshotService;

/// Runs the read/write loop for a single WebSocket connection.
///
/// - Reads commands from the client and dispatches them.
/// - Forwards snapshots for subscribed rooms from the
///   [`broadcast::Receiver`] to the client.
pub async fn run_connection(
    socket: WebSocket,
    mut snapshot_rx: broadcast::Receiver<RoomSnapshot>,
    snapshots: SnapshotService,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subs = SubscriptionManager::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_text_message(&text, &mut subs, &snapshots).await;
                        let mut closed = false;
                        for reply in replies {
                            let Ok(json) = serde_json::to_string(&reply) else {
                                continue;
                            };
                            if ws_tx.send(Message::text(json)).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
            update = snapshot_rx.recv() => {
                match update {
                    Ok(snapshot) => {
                        if subs.matches(snapshot.room_id) {
                            let json = serde_json::to_string(&snapshot_event(&snapshot))
                                .unwrap_or_default();
                            if ws_tx.send(Message::text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "ws client lagged behind snapshot bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

fn snapshot_event(snapshot: &RoomSnapshot) -> WsMessage {
    WsMessage::server(
        uuid::Uuid::new_v4().to_string(),
        WsMessageType::Event,
        serde_json::to_value(snapshot).unwrap_or_default(),
    )
}

/// Handles a text frame. A subscribe reply is followed by the current
/// snapshot of every explicitly named room.
async fn handle_text_message(
    text: &str,
    subs: &mut SubscriptionManager,
    snapshots: &SnapshotService,
) -> Vec<WsMessage> {
    let Ok(msg) = serde_json::from_str::<WsMessage>(text) else {
        return vec![WsMessage::error("", 400, "malformed JSON")];
    };
    let Ok(command) = serde_json::from_value::<WsCommand>(msg.payload) else {
        return vec![WsMessage::error(msg.id, 404, "unknown command")];
    };

    match command {
        WsCommand::Subscribe { room_ids } => {
            let filter = RoomFilter::parse(&room_ids);
            subs.subscribe(&filter);
            let mut replies = vec![WsMessage::server(
                msg.id,
                WsMessageType::Response,
                serde_json::json!({
                    "subscribed": filter.rooms.iter().map(RoomId::to_string).collect::<Vec<_>>(),
                    "rejected": filter.invalid,
                    "count": subs.count(),
                    "wildcard": subs.is_subscribed_all(),
                }),
            )];
            for room_id in &filter.rooms {
                match snapshots.get(*room_id).await {
                    Ok(snapshot) => replies.push(snapshot_event(&snapshot)),
                    Err(e) => tracing::warn!(%room_id, error = %e, "initial snapshot unavailable"),
                }
            }
            replies
        }
        WsCommand::Unsubscribe { room_ids } => {
            let filter = RoomFilter::parse(&room_ids);
            subs.unsubscribe(&filter);
            vec![WsMessage::server(
                msg.id,
                WsMessageType::Response,
                serde_json::json!({
                    "unsubscribed": filter.rooms.iter().map(RoomId::to_string).collect::<Vec<_>>(),
                    "remaining_count": subs.count(),
                    "wildcard": subs.is_subscribed_all(),
                }),
            )]
        }
        WsCommand::GetSnapshot { room_id } => {
            let Ok(room_id) = room_id.parse::<RoomId>() else {
                return vec![WsMessage::error(msg.id, 400, "invalid room id")];
            };
            match snapshots.get(room_id).await {
                Ok(snapshot) => vec![WsMessage::server(
                    msg.id,
                    WsMessageType::Response,
                    serde_json::to_value(&snapshot).unwrap_or_default(),
                )],
                Err(e) => vec![WsMessage::error(msg.id, e.status_code().as_u16(), &e.to_string())],
            }
        }
    }
}
