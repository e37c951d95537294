//! WebSocket endpoint bridging sockets to the realtime router

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;
use lendahand_realtime::{ClientFrame, ServerFrame};

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    /// Session token. Browsers cannot set an Authorization header on a
    /// WebSocket handshake, so it travels as a query parameter.
    token: String,
    /// Conversation to join immediately after the handshake.
    conversation_id: Option<String>,
}

pub fn create_websocket_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/conversations", get(conversation_websocket_handler))
}

pub async fn conversation_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RealtimeQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, query: RealtimeQuery) {
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerFrame>(state.realtime_config.outbound_queue_depth);

    let mut session = match state
        .realtime
        .open_session(&query.token, query.conversation_id.as_deref(), outbound_tx)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            // Authentication failures are fatal: report once, then drop.
            if let Ok(text) = serde_json::to_string(&err.to_frame()) {
                let _ = socket.send(Message::Text(text)).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut socket_tx, mut socket_rx) = socket.split();

    // Drain the registry-owned queue into the socket. Ends when the
    // registry drops its sender, on eviction or after close_session.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "dropping unserialisable frame");
                    continue;
                }
            };

            if socket_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }

        let _ = socket_tx.send(Message::Close(None)).await;
    });

    let idle_timeout = Duration::from_secs(state.realtime_config.idle_timeout_seconds);

    loop {
        let inbound = match tokio::time::timeout(idle_timeout, socket_rx.next()).await {
            Err(_) => {
                debug!(
                    user = %session.identity().public_id,
                    "closing idle realtime connection"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        match inbound {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => state.realtime.handle_frame(&mut session, frame).await,
                Err(err) => {
                    state
                        .realtime
                        .reject_invalid(&session, format!("malformed frame: {err}"))
                        .await
                }
            },
            Message::Close(_) => break,
            // Ping and pong are handled by the protocol layer; binary
            // frames are not part of the wire contract.
            _ => {}
        }
    }

    state.realtime.close_session(session).await;
    let _ = write_task.await;
}
