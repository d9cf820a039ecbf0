use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::protocol::DisplayState;

/// Named snapshot of desired display states, keyed by client id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub clients: BTreeMap<String, DisplayState>,
}

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("failed to read presets {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse presets {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("failed to write presets {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to encode presets: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Verdict of [`PresetStore::check_integrity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Ok,
    Missing,
    Empty,
    Invalid,
    Corrupt,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets: Option<Vec<String>>,
}

impl IntegrityReport {
    fn new(status: IntegrityStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            presets: None,
        }
    }
}

/// Presets held in memory and persisted as one JSON object on disk.
///
/// Every save first copies the current file to `<file>.backup`.
pub struct PresetStore {
    path: PathBuf,
    presets: RwLock<BTreeMap<String, Preset>>,
    save_lock: Mutex<()>,
}

impl PresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            presets: RwLock::new(BTreeMap::new()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the copy kept from before the most recent save.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Replace the in-memory presets with the file's contents.
    ///
    /// A missing file loads as empty. On any error the in-memory set is left
    /// untouched.
    pub fn load(&self) -> Result<usize, PresetError> {
        if !self.path.exists() {
            tracing::warn!(path = %self.path.display(), "preset file not found, using empty presets");
            return Ok(0);
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| PresetError::Read(self.path.clone(), e))?;
        let loaded: BTreeMap<String, Preset> = serde_json::from_str(&contents)
            .map_err(|e| PresetError::Parse(self.path.clone(), e))?;
        let count = loaded.len();
        *self.presets.write() = loaded;
        tracing::info!(count, path = %self.path.display(), "loaded presets");
        Ok(count)
    }

    /// Write every preset to disk, keeping a backup of the previous file.
    pub fn save(&self) -> Result<(), PresetError> {
        let _guard = self.save_lock.lock();
        if self.path.exists() {
            let backup = self.backup_path();
            match std::fs::copy(&self.path, &backup) {
                Ok(_) => tracing::info!(path = %backup.display(), "created preset backup"),
                Err(e) => tracing::warn!(path = %backup.display(), error = %e, "failed to create preset backup"),
            }
        } else if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PresetError::Write(self.path.clone(), e))?;
            }
        }

        let snapshot = self.presets.read().clone();
        let contents = serde_json::to_string_pretty(&snapshot).map_err(PresetError::Encode)?;
        std::fs::write(&self.path, contents)
            .map_err(|e| PresetError::Write(self.path.clone(), e))?;
        tracing::info!(count = snapshot.len(), path = %self.path.display(), "saved presets");
        Ok(())
    }

    /// Add or overwrite a preset in memory.
    pub fn add(&self, name: &str, preset: Preset) {
        self.presets.write().insert(name.to_string(), preset);
        tracing::info!(name = %name, "added/updated preset");
    }

    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.presets.write().remove(name).is_some();
        if removed {
            tracing::info!(name = %name, "deleted preset");
        }
        removed
    }

    /// Preset names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.presets.read().keys().cloned().collect()
    }

    /// Inspect the file on disk without touching the in-memory presets.
    pub fn check_integrity(&self) -> IntegrityReport {
        check_file_integrity(&self.path)
    }
}

/// Classify a preset file as `ok`, `missing`, `empty`, `invalid` (valid JSON
/// but not an object), `corrupt` (not JSON) or `error` (unreadable).
pub fn check_file_integrity(path: &Path) -> IntegrityReport {
    if !path.exists() {
        return IntegrityReport::new(
            IntegrityStatus::Missing,
            format!("Presets file does not exist: {}", path.display()),
        );
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            return IntegrityReport::new(
                IntegrityStatus::Error,
                format!("Error checking presets file: {}", e),
            )
        }
    };
    if contents.trim().is_empty() {
        return IntegrityReport::new(IntegrityStatus::Empty, "Presets file is empty");
    }
    let parsed: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            return IntegrityReport::new(
                IntegrityStatus::Corrupt,
                format!("Presets file is corrupt: {}", e),
            )
        }
    };
    match parsed.as_object() {
        Some(map) => IntegrityReport {
            status: IntegrityStatus::Ok,
            detail: format!("Presets file is valid with {} presets", map.len()),
            presets: Some(map.keys().cloned().collect()),
        },
        None => IntegrityReport::new(
            IntegrityStatus::Invalid,
            format!("Presets file is not a valid dictionary. Type: {}", json_type_name(&parsed)),
        ),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
