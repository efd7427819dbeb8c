//! Realtime channel: broadcaster events streamed as JSON frames

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One subscriber per connection. If the client cannot keep up, the
/// broadcaster drops the subscription and the receive loop ends.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let subscriber_id = format!("ws-{}", overseer_core::new_id());
    let mut events = state.broadcaster.subscribe(&subscriber_id);
    info!(subscriber = %subscriber_id, "event stream connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let Ok(frame) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if ws_tx.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Dropped by the broadcaster (overflow) or shutdown.
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(subscriber = %subscriber_id, error = %e, "websocket error");
                        break;
                    }
                    // Clients only listen on this channel.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&subscriber_id);
    info!(subscriber = %subscriber_id, "event stream disconnected");
}
