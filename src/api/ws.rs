//! WebSocket subscriber loop. One connection, one `Subscriber` row in
//! the Broadcaster; server pushes `packet` messages, client may send
//! `toggle_attack` scoped to its own owner. Idle ping/pong closes the
//! connection after three missed replies.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, Packet};

use super::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u32 = 3;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Packet { packet: Packet },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ToggleAttack { attack: bool },
}

/// Handshake: owner is resolved from the upgrade request's headers/cookies,
/// same as any HTTP request — there is no separate socket auth step.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, headers: HeaderMap) -> Response {
    let resolved = state.identity.resolve(&headers).await;
    ws.on_upgrade(move |socket| handle_socket(socket, state, resolved.owner_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, owner: OwnerId) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (_subscriber, queue) = state.broadcaster.subscribe(owner.clone(), conn_id.clone());
    state.pipeline.ensure_running(&owner);

    let (mut sink, mut stream) = socket.split();
    let mut missed_pongs: u32 = 0;
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            packet = queue.recv() => {
                let message = ServerMessage::Packet { packet };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::ToggleAttack { attack }) = serde_json::from_str::<ClientMessage>(&text) {
                            state.pipeline.toggle_attack(&owner, attack);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    tracing::debug!(owner_id = %owner, "closing socket after missed pongs");
                    break;
                }
                missed_pongs += 1;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let now_empty = state.broadcaster.unsubscribe(&owner, &conn_id);
    if now_empty {
        state.pipeline.schedule_idle_teardown(&owner);
    }
}
