#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use screenhub::api::{self, AppState};
use screenhub::auth::{AuthGate, TokenStore};
use screenhub::presets::PresetStore;
use screenhub::registry::ClientRegistry;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWrite = SplitSink<WsStream, Message>;
pub type WsRead = SplitStream<WsStream>;

pub const SYSTEM: &str = "testhub";

/// A hub served on an ephemeral port, with its stores under a temp dir.
pub struct TestHub {
    pub state: AppState,
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
}

impl TestHub {
    pub async fn start() -> Self {
        Self::start_in(tempfile::tempdir().unwrap()).await
    }

    /// Start a hub whose preset and token files live in `dir`, so a second
    /// hub over the same dir sees what the first persisted.
    pub async fn start_in(dir: tempfile::TempDir) -> Self {
        let presets = PresetStore::new(dir.path().join("presets.json"));
        presets.load().unwrap();
        let auth = AuthGate::load(TokenStore::new(dir.path().join("auth.json")));
        let state = AppState::new(ClientRegistry::new(SYSTEM), auth, presets);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::router(state.clone());
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self { state, addr, dir }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> (WsWrite, WsRead) {
        let (ws, _) = connect_async(self.url()).await.expect("failed to connect");
        ws.split()
    }

    /// Stop the hub and hand back its state dir.
    pub async fn stop(self) -> tempfile::TempDir {
        self.state.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.dir
    }
}

pub async fn send_json(tx: &mut WsWrite, frame: Value) {
    send_raw(tx, &frame.to_string()).await;
}

pub async fn send_raw(tx: &mut WsWrite, text: &str) {
    tx.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Receive the next text message and parse it as JSON.
pub async fn recv_json(rx: &mut WsRead) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Receive messages until one of the given `type` arrives.
pub async fn recv_type(rx: &mut WsRead, kind: &str) -> Value {
    loop {
        let frame = recv_json(rx).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Receive `client_list` broadcasts until `pred` holds for one.
pub async fn recv_client_list_where(rx: &mut WsRead, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let frame = recv_type(rx, "client_list").await;
        if pred(&frame["clients"]) {
            return frame;
        }
    }
}

/// Assert no text message arrives within `wait`.
pub async fn assert_silent(rx: &mut WsRead, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(wait, rx.next()).await {
        panic!("expected no message, got {}", text.as_str());
    }
}

pub fn register_frame(client_id: &str, capabilities: &[&str], token: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "register",
        "client_id": client_id,
        "info": {"name": client_id, "capabilities": capabilities},
    });
    if let Some(token) = token {
        frame["token"] = Value::from(token);
    }
    frame
}

/// Connect and register; returns the socket halves and the `registered` ack.
pub async fn connect_registered(
    hub: &TestHub,
    client_id: &str,
    capabilities: &[&str],
    token: Option<&str>,
) -> (WsWrite, WsRead, Value) {
    let (mut tx, mut rx) = hub.connect().await;
    send_json(&mut tx, register_frame(client_id, capabilities, token)).await;
    let ack = recv_type(&mut rx, "registered").await;
    (tx, rx, ack)
}
