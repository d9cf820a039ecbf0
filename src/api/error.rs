use crate::protocol::ServerMessage;

/// Structured error for request handling on a hub connection.
///
/// Every variant is reported to the requesting connection as an `error`
/// frame; none of them closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A required top-level key is absent.
    MissingField(String),
    /// A field is present but has the wrong shape or value.
    InvalidField(String),
    /// `mode` outside the closed set of display modes.
    InvalidMode(String),
    /// Known client id with a wrong or missing token.
    AuthenticationFailed,
    /// Frame is not a JSON object. Detail is deliberately not reported.
    Decode,
    /// `type` names no handler.
    UnknownType(String),
    /// Preset name with no stored preset.
    PresetNotFound(String),
    /// The preset file could not be written.
    PresetSaveFailed,
}

impl DispatchError {
    /// Returns a machine-readable error code string, used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::MissingField(_) => "missing_field",
            DispatchError::InvalidField(_) => "invalid_field",
            DispatchError::InvalidMode(_) => "invalid_mode",
            DispatchError::AuthenticationFailed => "authentication_failed",
            DispatchError::Decode => "decode_error",
            DispatchError::UnknownType(_) => "unknown_type",
            DispatchError::PresetNotFound(_) => "preset_not_found",
            DispatchError::PresetSaveFailed => "preset_save_failed",
        }
    }

    /// Returns the human-readable message carried by the `error` frame.
    pub fn message(&self) -> String {
        match self {
            DispatchError::MissingField(field) => format!("Missing required field: {}", field),
            DispatchError::InvalidField(detail) => format!("Invalid field: {}", detail),
            DispatchError::InvalidMode(mode) => format!("Invalid mode: {}", mode),
            DispatchError::AuthenticationFailed => "Authentication failed".to_string(),
            DispatchError::Decode => "Invalid JSON message".to_string(),
            DispatchError::UnknownType(kind) => format!("Unknown message type: {}", kind),
            DispatchError::PresetNotFound(name) => format!("Preset not found: {}", name),
            DispatchError::PresetSaveFailed => "Failed to save presets".to_string(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for ServerMessage {
    fn from(err: DispatchError) -> Self {
        ServerMessage::error(err.message())
    }
}
