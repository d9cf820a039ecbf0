pub mod dispatch;
pub mod error;
mod handlers;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthGate;
use crate::presets::PresetStore;
use crate::registry::ClientRegistry;

use handlers::*;

/// Maximum concurrent hub WebSocket connections.
///
/// Each connection owns an unbounded outbound queue; the cap keeps a runaway
/// client from exhausting memory by opening thousands of sockets.
const MAX_HUB_CONNECTIONS: usize = 256;

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub registry: ClientRegistry,
    pub auth: Arc<AuthGate>,
    pub presets: Arc<PresetStore>,
    /// Cancelled once to close every open connection.
    pub shutdown: CancellationToken,
    /// Live WebSocket connections, for the connection cap.
    pub connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(registry: ClientRegistry, auth: AuthGate, presets: PresetStore) -> Self {
        Self {
            registry,
            auth: Arc::new(auth),
            presets: Arc::new(presets),
            shutdown: CancellationToken::new(),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
}
