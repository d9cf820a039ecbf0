use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::liveness::Thresholds;

/// Hub configuration, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// System name echoed in acknowledgements and listings.
    pub system: String,
    /// Address the WebSocket listener binds to.
    pub bind: SocketAddr,
    /// JSON file holding named presets.
    pub presets_file: PathBuf,
    /// JSON file holding issued client tokens.
    pub auth_file: PathBuf,
    pub liveness: LivenessConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            system: "screenhub".into(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8765)),
            presets_file: PathBuf::from("screenhub_presets.json"),
            auth_file: PathBuf::from("screenhub_auth.json"),
            liveness: LivenessConfig::default(),
        }
    }
}

/// `[liveness]` section, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub sweep_interval_secs: u64,
    pub lost_after_secs: u64,
    pub offline_after_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            lost_after_secs: 10,
            offline_after_secs: 60,
        }
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            lost_after: Duration::from_secs(self.lost_after_secs),
            offline_after: Duration::from_secs(self.offline_after_secs),
        }
    }
}

impl HubConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject liveness settings the state machine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.liveness;
        if l.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("liveness.sweep_interval_secs must be positive".into()));
        }
        if l.lost_after_secs == 0 {
            return Err(ConfigError::Invalid("liveness.lost_after_secs must be positive".into()));
        }
        if l.lost_after_secs >= l.offline_after_secs {
            return Err(ConfigError::Invalid(format!(
                "liveness.lost_after_secs ({}) must be below liveness.offline_after_secs ({})",
                l.lost_after_secs, l.offline_after_secs
            )));
        }
        if self.system.trim().is_empty() {
            return Err(ConfigError::Invalid("system must not be empty".into()));
        }
        Ok(())
    }

    /// Apply a `PORT` override, keeping the configured interface.
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind.set_port(port);
        self
    }

    /// Layer the sources in increasing precedence: defaults, the TOML file
    /// at `path` (if present), `port`, then an explicit `bind`.
    pub fn resolve(
        path: Option<&Path>,
        port: Option<u16>,
        bind: Option<SocketAddr>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?.unwrap_or_else(|| {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }),
            None => Self::default(),
        };
        if let Some(port) = port {
            config = config.with_port(port);
        }
        if let Some(bind) = bind {
            config.bind = bind;
        }
        Ok(config)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn when a file that may contain tokens is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "{} is world-readable (mode {:o}). \
             It contains client tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// Resolve a display name for this machine: explicit override, else the
/// system hostname.
pub fn resolve_hostname(name: Option<&str>) -> String {
    if let Some(name) = name {
        return name.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
