//! Wire protocol for hub <-> display communication.
//!
//! Every WebSocket text message carries exactly one JSON object with a
//! `type` discriminator. Inbound requests are validated field-by-field by the
//! dispatcher (see [`crate::api::dispatch`]); outbound frames are the
//! [`ServerMessage`] enum below.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::presets::IntegrityReport;

/// Desired rendering attributes of one display (`mode`, `background`,
/// `number`, `image`). Patches replace whole keys; nested values are never
/// merged.
pub type DisplayState = Map<String, Value>;

/// Display modes a client knows how to render.
pub const DISPLAY_MODES: &[&str] = &["color", "image"];

/// Capability marking a client as an observer that receives registry
/// snapshots.
pub const ADMIN_CAPABILITY: &str = "admin";

/// State a display starts from when its register frame carries none.
pub fn default_display() -> DisplayState {
    let mut display = Map::new();
    display.insert("mode".into(), Value::from("color"));
    display.insert("background".into(), Value::from("#000000"));
    display.insert("number".into(), Value::from("0"));
    display.insert("image".into(), Value::from(""));
    display
}

/// Merge `patch` into `display`, replacing each key wholesale.
pub fn merge_display(display: &mut DisplayState, patch: &DisplayState) {
    for (key, value) in patch {
        display.insert(key.clone(), value.clone());
    }
}

/// Liveness of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Online,
    Lost,
    Offline,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Lost => "lost",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Declared identity of a display. Only `capabilities` is interpreted; the
/// remaining keys (name, ip, ...) are kept verbatim for listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of a `register` request.
#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    pub client_id: String,
    pub info: ClientInfo,
    pub token: Option<String>,
    pub display: Option<DisplayState>,
}

/// Parameters of a `heartbeat` request.
#[derive(Debug, Deserialize)]
pub struct HeartbeatParams {
    pub client_id: String,
}

/// Parameters of an `update_display` request.
#[derive(Debug, Deserialize)]
pub struct UpdateDisplayParams {
    pub clients: Vec<String>,
    pub display: DisplayState,
}

/// Parameters of `save_preset` / `load_preset`.
#[derive(Debug, Deserialize)]
pub struct PresetNameParams {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// Per-client view published by `get_clients` and admin broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub status: ClientStatus,
    pub capabilities: Vec<String>,
    pub info: Map<String, Value>,
    pub display: DisplayState,
    /// Unix time of the last heartbeat or registration, in milliseconds.
    pub last_seen: u64,
}

/// Every frame the hub sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        client_id: String,
        system: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    DisplayUpdate {
        display: DisplayState,
    },
    DisplayUpdated {
        updated_clients: Vec<String>,
    },
    PresetSaved {
        name: String,
        system: String,
    },
    PresetLoaded {
        name: String,
        updated_clients: Vec<String>,
        system: String,
    },
    ClientList {
        clients: BTreeMap<String, ClientSnapshot>,
        system: String,
    },
    PresetList {
        presets: Vec<String>,
        system: String,
    },
    PresetsIntegrityResult {
        result: IntegrityReport,
        system: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to the JSON text carried by one WebSocket message.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
