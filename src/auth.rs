//! Trust-on-first-use authentication of display clients.
//!
//! The first registration of an unknown client id is accepted and issued a
//! random token. Every later registration of that id must present the same
//! token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use subtle::ConstantTimeEq;

/// Length of issued tokens. 32 alphanumeric characters carry ~190 bits.
const TOKEN_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("failed to read token file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse token file {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("failed to write token file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to encode tokens: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed for client {0}")]
    Rejected(String),
    #[error("client {0} already holds a token")]
    AlreadyIssued(String),
}

/// JSON file mapping client id to token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all tokens. A missing file is an empty store.
    pub fn load(&self) -> Result<HashMap<String, String>, TokenStoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        crate::config::check_config_permissions(&self.path);
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| TokenStoreError::Read(self.path.clone(), e))?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| TokenStoreError::Parse(self.path.clone(), e))
    }

    /// Rewrite the file with `tokens`, readable by the owner only.
    pub fn save(&self, tokens: &HashMap<String, String>) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TokenStoreError::Write(self.path.clone(), e))?;
            }
        }
        let contents = serde_json::to_string_pretty(tokens).map_err(TokenStoreError::Encode)?;
        std::fs::write(&self.path, contents)
            .map_err(|e| TokenStoreError::Write(self.path.clone(), e))?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), error = %e, "failed to restrict token file permissions");
    }
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) {}

/// Result of admitting a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Known id presented its stored token.
    Known,
    /// First contact: a token was issued and must be handed to the client.
    FirstContact { token: String },
}

/// Token issuance and verification, optionally backed by a [`TokenStore`].
pub struct AuthGate {
    tokens: Mutex<HashMap<String, String>>,
    store: Option<TokenStore>,
    /// Serializes file rewrites so the last writer always holds every token.
    persist: Mutex<()>,
}

impl AuthGate {
    /// Gate with no persistence.
    pub fn in_memory() -> Self {
        Self::with_tokens(HashMap::new(), None)
    }

    pub fn with_tokens(tokens: HashMap<String, String>, store: Option<TokenStore>) -> Self {
        Self {
            tokens: Mutex::new(tokens),
            store,
            persist: Mutex::new(()),
        }
    }

    /// Build a gate from the tokens persisted in `store`.
    ///
    /// An unreadable file is logged and treated as empty so the hub still
    /// starts; the next issued token rewrites it.
    pub fn load(store: TokenStore) -> Self {
        let tokens = match store.load() {
            Ok(tokens) => {
                tracing::info!(count = tokens.len(), path = %store.path().display(), "loaded authentication tokens");
                tokens
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load authentication tokens");
                HashMap::new()
            }
        };
        Self::with_tokens(tokens, Some(store))
    }

    /// `true` if `client_id` may register with `presented`.
    ///
    /// Unknown ids need no token. Known ids need an exact match, compared in
    /// constant time.
    pub fn authenticate(&self, client_id: &str, presented: Option<&str>) -> bool {
        let tokens = self.tokens.lock();
        match tokens.get(client_id) {
            None => true,
            Some(stored) => tokens_match(stored, presented),
        }
    }

    /// Issue and persist a token for an id that has none.
    ///
    /// Refuses ids that already hold a token so a retried registration can
    /// never rotate the legitimate holder's secret.
    pub fn issue_token(&self, client_id: &str) -> Result<String, AuthError> {
        let token = {
            let mut tokens = self.tokens.lock();
            if tokens.contains_key(client_id) {
                return Err(AuthError::AlreadyIssued(client_id.to_string()));
            }
            let token = generate_token();
            tokens.insert(client_id.to_string(), token.clone());
            token
        };
        self.persist();
        Ok(token)
    }

    /// Authenticate and, on first contact, issue a token, atomically.
    pub fn admit(&self, client_id: &str, presented: Option<&str>) -> Result<Admission, AuthError> {
        let token = {
            let mut tokens = self.tokens.lock();
            match tokens.get(client_id) {
                Some(stored) => {
                    if tokens_match(stored, presented) {
                        tracing::info!(client_id = %client_id, "client authenticated");
                        return Ok(Admission::Known);
                    }
                    tracing::warn!(client_id = %client_id, "authentication failed: invalid or missing token");
                    return Err(AuthError::Rejected(client_id.to_string()));
                }
                None => {
                    let token = generate_token();
                    tokens.insert(client_id.to_string(), token.clone());
                    token
                }
            }
        };
        tracing::info!(client_id = %client_id, "issued token on first contact");
        self.persist();
        Ok(Admission::FirstContact { token })
    }

    pub fn has_token(&self, client_id: &str) -> bool {
        self.tokens.lock().contains_key(client_id)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().len()
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist.lock();
        let snapshot = self.tokens.lock().clone();
        if let Err(e) = store.save(&snapshot) {
            tracing::error!(error = %e, "failed to persist authentication tokens");
        }
    }
}

fn tokens_match(stored: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) => presented.as_bytes().ct_eq(stored.as_bytes()).into(),
        None => false,
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
