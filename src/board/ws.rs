use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{Board, Task};

// ── Event types ───────────────────────────────────────────────────────

/// Notifications fanned out to connected clients after successful commits,
/// so cached board views get refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BoardEvent {
    BoardCreated { board: Board },
    BoardChanged { board_id: String },
    BoardDeleted { board_id: String },
    TaskCreated { task: Task },
}

/// Serialize and fan out an event. A send error only means nobody is
/// subscribed right now.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &BoardEvent) {
    match serde_json::to_string(event) {
        Ok(msg) => {
            let _ = tx.send(msg);
        }
        Err(e) => tracing::warn!("Failed to serialize board event: {}", e),
    }
}

// ── WebSocket handler ─────────────────────────────────────────────────

pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(msg) => {
                    if sink.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("WebSocket client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}
