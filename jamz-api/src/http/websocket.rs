//! Signaling WebSocket
//!
//! Frames are JSON text. One task drains the connection's outbound queue into
//! the socket; the read loop hands each text frame to the gateway in order.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

use crate::gateway::ConnectionHandle;
use crate::http::AppState;

pub fn create_websocket_router() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_handler))
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let gateway = state.gateway;
    let ConnectionHandle {
        id,
        alive,
        mut outbound,
    } = gateway.connect();

    let (mut sink, mut stream) = socket.split();

    let writer_alive = alive.clone();
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_id, "Failed to encode {}: {}", event.name(), e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, "Failed to send WebSocket message: {}", e);
                writer_alive.store(false, Ordering::Release);
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => gateway.handle_text(&id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %id, "Ignoring binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    gateway.disconnect(&id).await;
    writer.abort();
}
