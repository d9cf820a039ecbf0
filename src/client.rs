//! Display client for the hub.
//!
//! Keeps a persistent WebSocket connection to the hub: registers with a
//! stable client id, re-presents the token it was issued on first contact,
//! sends heartbeats, and applies `display_update` patches to a local display
//! state that a renderer can watch. Lost connections are retried with
//! exponential backoff (1s..60s).

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{default_display, merge_display, DisplayState};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const CLIENT_ID_FILE: &str = "client_id";
const TOKEN_FILE: &str = "token";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Capabilities every display client declares.
pub const DISPLAY_CAPABILITIES: &[&str] = &["display", "image"];

/// Substring of the hub's error frame that means the stored token is stale.
const AUTH_FAILED: &str = "Authentication failed";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to access client state {0}: {1}")]
    State(PathBuf, #[source] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed before registration completed")]
    ClosedBeforeRegistration,
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("unexpected response to register: {0}")]
    UnexpectedResponse(String),
}

/// Default state directory: `<data_local_dir>/screenhub`.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("screenhub")
}

/// Persistent identity of this display: its client id and issued token.
#[derive(Debug)]
pub struct ClientIdentity {
    dir: PathBuf,
    client_id: String,
    token: Option<String>,
}

impl ClientIdentity {
    /// Read the identity from `dir`, generating and persisting a fresh
    /// client id on first run.
    pub fn load_or_create(dir: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ClientError::State(dir.clone(), e))?;

        let id_path = dir.join(CLIENT_ID_FILE);
        let client_id = match read_trimmed(&id_path)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                std::fs::write(&id_path, &id).map_err(|e| ClientError::State(id_path.clone(), e))?;
                tracing::info!(client_id = %id, "generated new client id");
                id
            }
        };
        let token = read_trimmed(&dir.join(TOKEN_FILE))?;

        Ok(Self {
            dir,
            client_id,
            token,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a token issued by the hub, readable by the owner only.
    pub fn store_token(&mut self, token: String) -> Result<(), ClientError> {
        let path = self.dir.join(TOKEN_FILE);
        std::fs::write(&path, &token).map_err(|e| ClientError::State(path.clone(), e))?;
        crate::auth::restrict_permissions(&path);
        self.token = Some(token);
        Ok(())
    }

    /// Forget the stored token so the next registration is a first contact.
    pub fn clear_token(&mut self) -> Result<(), ClientError> {
        self.token = None;
        let path = self.dir.join(TOKEN_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::State(path, e)),
        }
    }
}

fn read_trimmed(path: &Path) -> Result<Option<String>, ClientError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClientError::State(path.to_path_buf(), e)),
    }
}

/// Next reconnect delay: doubled, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Hub WebSocket URL, e.g. `ws://hub.local:8765/ws`.
    pub server: String,
    /// Display name reported in `info.name`.
    pub name: String,
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
}

impl ClientOptions {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// How a registered session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Cancelled,
}

/// A display that stays connected to the hub until cancelled.
pub struct DisplayClient {
    options: ClientOptions,
    identity: ClientIdentity,
    display: watch::Sender<DisplayState>,
}

impl DisplayClient {
    pub fn new(options: ClientOptions, identity: ClientIdentity) -> Self {
        let (display, _) = watch::channel(default_display());
        Self {
            options,
            identity,
            display,
        }
    }

    /// Watch the local display state. Every applied patch notifies.
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.display.subscribe()
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The `register` request for the current identity and display state.
    pub fn register_frame(&self) -> Value {
        let mut frame = json!({
            "type": "register",
            "client_id": self.identity.client_id(),
            "info": {
                "name": self.options.name,
                "capabilities": DISPLAY_CAPABILITIES,
            },
            "display": *self.display.borrow(),
        });
        if let Some(token) = self.identity.token() {
            frame["token"] = Value::from(token);
        }
        frame
    }

    /// Connect, register and serve until `cancel` fires, reconnecting with
    /// exponential backoff after every failure or disconnect.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            tracing::info!(server = %self.options.server, "connecting to hub");

            match self.session(&cancel).await {
                Ok(SessionEnd::Cancelled) => return,
                Ok(SessionEnd::Disconnected) => {
                    tracing::warn!(server = %self.options.server, "hub connection lost");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::error!(server = %self.options.server, error = %e, "hub session failed");
                }
            }

            tracing::info!(delay_secs = backoff.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = next_backoff(backoff, self.options.max_backoff);
        }
    }

    async fn session(&mut self, cancel: &CancellationToken) -> Result<SessionEnd, ClientError> {
        let (ws_stream, _) = tokio::select! {
            result = tokio_tungstenite::connect_async(self.options.server.as_str()) => result?,
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        };
        let (mut sink, mut stream) = ws_stream.split();

        let register = self.register_frame().to_string();
        sink.send(Message::Text(register.into())).await?;

        tokio::select! {
            result = self.await_registration(&mut stream) => result?,
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        }

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.tick().await; // Skip the first immediate tick.
        let heartbeat_frame = json!({
            "type": "heartbeat",
            "client_id": self.identity.client_id(),
        })
        .to_string();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return Ok(SessionEnd::Disconnected);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "hub read failed");
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(Message::Text(heartbeat_frame.clone().into())).await {
                        tracing::error!(error = %e, "failed to send heartbeat");
                        return Ok(SessionEnd::Disconnected);
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
            }
        }
    }

    /// Wait for the reply to `register`, storing or discarding the token.
    async fn await_registration(
        &mut self,
        stream: &mut futures::stream::SplitStream<WsStream>,
    ) -> Result<(), ClientError> {
        loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::ClosedBeforeRegistration),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            let reply: Value = serde_json::from_str(text.as_str())?;

            match reply.get("type").and_then(Value::as_str) {
                Some("registered") => {
                    tracing::info!(client_id = %self.identity.client_id(), "registered with hub");
                    if let Some(token) = reply.get("token").and_then(Value::as_str) {
                        self.identity.store_token(token.to_string())?;
                        tracing::info!("received and stored authentication token");
                    }
                    return Ok(());
                }
                Some("error") => {
                    let message = reply
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if message.contains(AUTH_FAILED) {
                        self.identity.clear_token()?;
                        tracing::warn!("authentication token cleared");
                    }
                    return Err(ClientError::Rejected(message));
                }
                // The hub may push to the new connection before the ack lands.
                Some("display_update") => self.handle_frame(text.as_str()),
                Some("client_list") => continue,
                _ => return Err(ClientError::UnexpectedResponse(text.as_str().to_string())),
            }
        }
    }

    /// Apply one frame received after registration.
    pub fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "invalid JSON from hub");
                return;
            }
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("display_update") => {
                let Some(patch) = frame.get("display").and_then(Value::as_object) else {
                    tracing::warn!("display_update without display object");
                    return;
                };
                self.display.send_modify(|display| merge_display(display, patch));
                let shown = Value::Object(patch.clone());
                tracing::info!(display = %shown, "display update received");
            }
            Some("error") => {
                tracing::error!(message = ?frame.get("message"), "error from hub");
            }
            Some("client_list") => {}
            other => {
                tracing::warn!(kind = ?other, "unknown message type from hub");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(dir: &tempfile::TempDir) -> DisplayClient {
        let identity = ClientIdentity::load_or_create(dir.path()).unwrap();
        DisplayClient::new(ClientOptions::new("ws://127.0.0.1:1/ws", "Display-1"), identity)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(60);
        let mut delay = INITIAL_BACKOFF;
        let mut seen = vec![delay.as_secs()];
        for _ in 0..7 {
            delay = next_backoff(delay, max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn identity_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = ClientIdentity::load_or_create(dir.path()).unwrap();
        let second = ClientIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first.client_id(), second.client_id());
        assert!(uuid::Uuid::parse_str(first.client_id()).is_ok());
        assert!(first.token().is_none());
    }

    #[test]
    fn token_is_stored_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = ClientIdentity::load_or_create(dir.path()).unwrap();
        identity.store_token("abc123".into()).unwrap();
        assert_eq!(
            ClientIdentity::load_or_create(dir.path()).unwrap().token(),
            Some("abc123")
        );

        identity.clear_token().unwrap();
        assert!(identity.token().is_none());
        assert!(ClientIdentity::load_or_create(dir.path()).unwrap().token().is_none());
        // Clearing twice is fine.
        identity.clear_token().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut identity = ClientIdentity::load_or_create(dir.path()).unwrap();
        identity.store_token("abc123".into()).unwrap();
        let mode = std::fs::metadata(dir.path().join(TOKEN_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn register_frame_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = client(&dir);
        let frame = c.register_frame();
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["client_id"], c.identity().client_id());
        assert_eq!(frame["info"]["name"], "Display-1");
        assert_eq!(frame["info"]["capabilities"], json!(["display", "image"]));
        assert_eq!(frame["display"]["mode"], "color");
        assert!(frame.get("token").is_none());

        c.identity.store_token("tok".into()).unwrap();
        assert_eq!(c.register_frame()["token"], "tok");
    }

    #[test]
    fn display_update_patches_local_state() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(&dir);
        let mut rx = c.subscribe();

        c.handle_frame(r##"{"type":"display_update","display":{"background":"#ff0000","number":"42"}}"##);
        assert!(rx.has_changed().unwrap());
        let display = rx.borrow_and_update().clone();
        assert_eq!(display["background"], "#ff0000");
        assert_eq!(display["number"], "42");
        assert_eq!(display["mode"], "color");

        c.handle_frame("not json");
        c.handle_frame(r#"{"type":"error","message":"boom"}"#);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn display_update_before_ack_is_kept() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let hub_accepts = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                hub_accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let _register = ws.next().await;
                    let update = json!({"type": "display_update", "display": {"background": "#ff0000"}});
                    let ack = json!({"type": "registered", "client_id": "x", "system": "fake"});
                    ws.send(Message::Text(update.to_string().into())).await.unwrap();
                    ws.send(Message::Text(ack.to_string().into())).await.unwrap();
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let identity = ClientIdentity::load_or_create(dir.path()).unwrap();
        let mut options = ClientOptions::new(format!("ws://{}/ws", addr), "Display-1");
        options.heartbeat_interval = Duration::from_millis(50);
        let c = DisplayClient::new(options, identity);
        let mut rx = c.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(c.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("update pushed before the ack should apply")
            .unwrap();
        assert_eq!(rx.borrow()["background"], "#ff0000");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1, "session should survive the early push");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("client should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_cancel_while_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(&dir);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(c.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("client should stop promptly")
            .unwrap();
    }
}
