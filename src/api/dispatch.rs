//! Request dispatch for hub connections.
//!
//! Every inbound text frame is decoded to a JSON object, routed on its `type`
//! key, checked against that type's required top-level fields, and only then
//! handed to a handler. A failure at any step yields an `error` frame and
//! leaves all shared state untouched.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::auth::Admission;
use crate::broadcast::broadcast_snapshot;
use crate::presets::Preset;
use crate::protocol::{
    ClientStatus, HeartbeatParams, PresetNameParams, RegisterParams, ServerMessage,
    UpdateDisplayParams, DISPLAY_MODES,
};
use crate::registry::{ApplyReport, ClientRegistry, ConnectionHandle, Registration};

use super::error::DispatchError;
use super::AppState;

// ---------------------------------------------------------------------------
// Request table
// ---------------------------------------------------------------------------

/// Request types a hub connection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Register,
    Heartbeat,
    UpdateDisplay,
    SavePreset,
    LoadPreset,
    GetClients,
    GetPresets,
    CheckPresetsIntegrity,
}

impl RequestKind {
    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "register" => Self::Register,
            "heartbeat" => Self::Heartbeat,
            "update_display" => Self::UpdateDisplay,
            "save_preset" => Self::SavePreset,
            "load_preset" => Self::LoadPreset,
            "get_clients" => Self::GetClients,
            "get_presets" => Self::GetPresets,
            "check_presets_integrity" => Self::CheckPresetsIntegrity,
            _ => return None,
        };
        Some(kind)
    }

    /// Top-level keys that must be present before the handler runs.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Register => &["client_id", "info"],
            Self::Heartbeat => &["client_id"],
            Self::UpdateDisplay => &["clients", "display"],
            Self::SavePreset | Self::LoadPreset => &["name"],
            Self::GetClients | Self::GetPresets | Self::CheckPresetsIntegrity => &[],
        }
    }
}

/// Per-connection dispatch context.
///
/// `client_id` is set by the first successful `register` on the connection
/// and is what the socket loop releases when the connection ends.
#[derive(Debug)]
pub struct ConnectionSession {
    pub handle: ConnectionHandle,
    pub client_id: Option<String>,
}

impl ConnectionSession {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            client_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Decode one text frame into a JSON object.
pub fn decode_frame(text: &str) -> Result<Map<String, Value>, DispatchError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(frame)) => Ok(frame),
        Ok(_) | Err(_) => Err(DispatchError::Decode),
    }
}

/// Handle one inbound text frame, returning the reply for the sender.
///
/// `None` means the request is acknowledged silently (heartbeats).
pub fn handle_text(state: &AppState, session: &mut ConnectionSession, text: &str) -> Option<ServerMessage> {
    let result = decode_frame(text).and_then(|frame| dispatch(state, session, frame));
    match result {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(
                code = err.code(),
                client_id = session.client_id.as_deref().unwrap_or("-"),
                connection = session.handle.id(),
                "{}",
                err
            );
            Some(err.into())
        }
    }
}

/// Route a decoded frame to its handler.
pub fn dispatch(
    state: &AppState,
    session: &mut ConnectionSession,
    frame: Map<String, Value>,
) -> Result<Option<ServerMessage>, DispatchError> {
    let kind = match frame.get("type") {
        None => return Err(DispatchError::MissingField("type".into())),
        Some(Value::String(kind)) => {
            RequestKind::parse(kind).ok_or_else(|| DispatchError::UnknownType(kind.clone()))?
        }
        Some(other) => return Err(DispatchError::UnknownType(other.to_string())),
    };
    require_fields(&frame, kind.required_fields())?;

    match kind {
        RequestKind::Register => register(state, session, parse_params(frame)?),
        RequestKind::Heartbeat => heartbeat(state, parse_params(frame)?),
        RequestKind::UpdateDisplay => update_display(state, parse_params(frame)?),
        RequestKind::SavePreset => save_preset(state, parse_params(frame)?),
        RequestKind::LoadPreset => load_preset(state, parse_params(frame)?),
        RequestKind::GetClients => Ok(Some(ServerMessage::ClientList {
            clients: state.registry.snapshot(),
            system: system(state),
        })),
        RequestKind::GetPresets => Ok(Some(ServerMessage::PresetList {
            presets: state.presets.names(),
            system: system(state),
        })),
        RequestKind::CheckPresetsIntegrity => Ok(Some(ServerMessage::PresetsIntegrityResult {
            result: state.presets.check_integrity(),
            system: system(state),
        })),
    }
}

fn require_fields(frame: &Map<String, Value>, fields: &[&str]) -> Result<(), DispatchError> {
    match fields.iter().find(|field| !frame.contains_key(**field)) {
        Some(field) => Err(DispatchError::MissingField((*field).to_string())),
        None => Ok(()),
    }
}

fn parse_params<T: DeserializeOwned>(frame: Map<String, Value>) -> Result<T, DispatchError> {
    serde_json::from_value(Value::Object(frame)).map_err(|e| DispatchError::InvalidField(e.to_string()))
}

fn system(state: &AppState) -> String {
    state.registry.system_name().to_string()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn register(
    state: &AppState,
    session: &mut ConnectionSession,
    params: RegisterParams,
) -> Result<Option<ServerMessage>, DispatchError> {
    if params.client_id.is_empty() {
        return Err(DispatchError::InvalidField("client_id must not be empty".into()));
    }
    // One client per connection; teardown only releases the bound id.
    if let Some(bound) = session.client_id.as_deref() {
        if bound != params.client_id {
            return Err(DispatchError::InvalidField(format!(
                "connection already registered as {}",
                bound
            )));
        }
    }

    let admission = state
        .auth
        .admit(&params.client_id, params.token.as_deref())
        .map_err(|e| {
            tracing::warn!(error = %e, "registration refused");
            DispatchError::AuthenticationFailed
        })?;

    let capabilities = params.info.capabilities.clone();
    let info = match serde_json::to_value(&params.info) {
        Ok(Value::Object(info)) => info,
        _ => Map::new(),
    };
    let mut ack = state.registry.register(Registration {
        client_id: params.client_id.clone(),
        connection: session.handle.clone(),
        capabilities,
        info,
        display: params.display,
    });
    if let (ServerMessage::Registered { token, .. }, Admission::FirstContact { token: issued }) =
        (&mut ack, admission)
    {
        *token = Some(issued);
    }

    session.client_id = Some(params.client_id);
    broadcast_snapshot(&state.registry);
    Ok(Some(ack))
}

fn heartbeat(state: &AppState, params: HeartbeatParams) -> Result<Option<ServerMessage>, DispatchError> {
    match state.registry.touch(&params.client_id) {
        None => {
            tracing::debug!(client_id = %params.client_id, "heartbeat from unregistered client");
        }
        Some(ClientStatus::Online) => {}
        // Revival from lost/offline is a status change admins should see.
        Some(_) => {
            broadcast_snapshot(&state.registry);
        }
    }
    Ok(None)
}

fn update_display(
    state: &AppState,
    params: UpdateDisplayParams,
) -> Result<Option<ServerMessage>, DispatchError> {
    if let Some(mode) = params.display.get("mode") {
        validate_mode(mode)?;
    }

    let report = state.registry.apply_display(&params.clients, &params.display);
    broadcast_snapshot(&state.registry);
    Ok(Some(ServerMessage::DisplayUpdated {
        updated_clients: report.updated_ids(),
    }))
}

fn validate_mode(mode: &Value) -> Result<(), DispatchError> {
    match mode.as_str() {
        Some(m) if DISPLAY_MODES.contains(&m) => Ok(()),
        Some(m) => Err(DispatchError::InvalidMode(m.to_string())),
        None => Err(DispatchError::InvalidMode(mode.to_string())),
    }
}

fn save_preset(state: &AppState, params: PresetNameParams) -> Result<Option<ServerMessage>, DispatchError> {
    let preset = Preset {
        clients: state.registry.display_states(),
    };
    let targets = preset.clients.len();
    state.presets.add(&params.name, preset);
    state.presets.save().map_err(|e| {
        tracing::error!(preset = %params.name, error = %e, "failed to persist presets");
        DispatchError::PresetSaveFailed
    })?;

    tracing::info!(preset = %params.name, clients = targets, "preset saved");
    Ok(Some(ServerMessage::PresetSaved {
        name: params.name,
        system: system(state),
    }))
}

fn load_preset(state: &AppState, params: PresetNameParams) -> Result<Option<ServerMessage>, DispatchError> {
    let preset = state
        .presets
        .get(&params.name)
        .ok_or_else(|| DispatchError::PresetNotFound(params.name.clone()))?;

    let report = apply_preset(&state.registry, &preset);
    broadcast_snapshot(&state.registry);

    let updated_clients = report.updated_ids();
    tracing::info!(preset = %params.name, updated = updated_clients.len(), "preset loaded");
    Ok(Some(ServerMessage::PresetLoaded {
        name: params.name,
        updated_clients,
        system: system(state),
    }))
}

/// Push each stored state to its client. Ids no longer registered are skipped.
fn apply_preset(registry: &ClientRegistry, preset: &Preset) -> ApplyReport {
    let mut report = ApplyReport::default();
    for (client_id, display) in &preset.clients {
        report.extend(registry.apply_display(std::slice::from_ref(client_id), display));
    }
    report
}
