use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use crate::broadcast::broadcast_snapshot;
use crate::protocol::ServerMessage;
use crate::registry::ConnectionHandle;

use super::dispatch::{handle_text, ConnectionSession};
use super::error::DispatchError;
use super::{AppState, MAX_HUB_CONNECTIONS};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Holds one slot of the connection cap until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let current = counter.fetch_add(1, Ordering::AcqRel);
        if current >= max {
            counter.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(Self(counter.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

pub(super) async fn ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state.connections, MAX_HUB_CONNECTIONS) else {
        tracing::warn!(max = MAX_HUB_CONNECTIONS, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    ws.on_upgrade(move |socket| handle_ws(socket, state, slot))
}

async fn handle_ws(socket: WebSocket, state: AppState, _slot: ConnectionSlot) {
    let (handle, mut outbound) = ConnectionHandle::channel();
    let mut session = ConnectionSession::new(handle);
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::debug!(connection = session.handle.id(), "connection opened");

    // Replies and pushed frames share the outbound queue so they reach the
    // socket in the order they were produced.
    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&state, &mut session, text.as_str()),
                    Some(Ok(Message::Binary(_))) => Some(ServerMessage::from(DispatchError::Decode)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(connection = session.handle.id(), error = %e, "websocket read failed");
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if let Err(e) = session.handle.send(&reply) {
                        tracing::error!(connection = session.handle.id(), error = %e, "failed to queue reply");
                        break;
                    }
                }
            }

            _ = state.shutdown.cancelled() => {
                tracing::debug!("WebSocket received shutdown signal, closing");
                let close_frame = CloseFrame {
                    code: axum::extract::ws::close_code::NORMAL,
                    reason: "server shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break;
            }
        }
    }

    if let Some(client_id) = session.client_id.take() {
        if state.registry.release(&client_id, session.handle.id()) {
            tracing::info!(client_id = %client_id, "client disconnected");
            broadcast_snapshot(&state.registry);
        } else {
            tracing::debug!(client_id = %client_id, "superseded connection closed");
        }
    }
    tracing::debug!(connection = session.handle.id(), "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_slots_are_capped_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).unwrap();
        let _second = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(first);
        assert!(ConnectionSlot::acquire(&counter, 2).is_some());
    }
}
