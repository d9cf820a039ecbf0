use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::liveness::{self, Thresholds};
use crate::protocol::{
    default_display, merge_display, ClientSnapshot, ClientStatus, DisplayState, ServerMessage,
    ADMIN_CAPABILITY,
};

/// The pushed frame could not be handed to the connection's writer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half of one WebSocket connection.
///
/// The connection task owns the receiving half and writes every queued text
/// to the socket. Once that task exits, every send fails with
/// [`DeliveryError::Closed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its connection task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
        };
        (handle, rx)
    }

    /// Unique id of the underlying connection (not the client id).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, msg: &ServerMessage) -> Result<(), DeliveryError> {
        let text = msg.to_text()?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        self.tx.send(text).map_err(|_| DeliveryError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a successful `register` request contributes to the registry.
#[derive(Debug)]
pub struct Registration {
    pub client_id: String,
    pub connection: ConnectionHandle,
    pub capabilities: Vec<String>,
    pub info: Map<String, Value>,
    /// Declared display state; `None` keeps the state of an existing entry
    /// and falls back to [`default_display`] for a new one.
    pub display: Option<DisplayState>,
}

/// Outcome of one target of a multi-target display update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOutcome {
    /// State merged and the `display_update` frame was queued.
    Applied,
    /// Target id is not registered; nothing changed.
    SkippedUnknown,
    /// State merged but the connection is gone. The merge is kept.
    DeliveryFailed,
}

/// Per-target result of [`ClientRegistry::apply_display`].
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<(String, TargetOutcome)>,
}

impl ApplyReport {
    /// Ids whose update was both stored and delivered, in request order.
    pub fn updated_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == TargetOutcome::Applied)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn extend(&mut self, other: ApplyReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// One status transition observed by a liveness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub client_id: String,
    pub from: ClientStatus,
    pub to: ClientStatus,
    pub elapsed: Duration,
}

struct ClientEntry {
    connection: ConnectionHandle,
    capabilities: BTreeSet<String>,
    info: Map<String, Value>,
    display: DisplayState,
    status: ClientStatus,
    /// Wall-clock time of the last heartbeat, reported in snapshots.
    last_seen: SystemTime,
    /// Monotonic time of the last heartbeat; liveness is measured from here.
    heard_at: Instant,
}

impl ClientEntry {
    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            status: self.status,
            capabilities: self.capabilities.iter().cloned().collect(),
            info: self.info.clone(),
            display: self.display.clone(),
            last_seen: unix_millis(self.last_seen),
        }
    }
}

struct RegistryInner {
    clients: HashMap<String, ClientEntry>,
    /// Ids whose capabilities contain [`ADMIN_CAPABILITY`]. Rebuilt on every
    /// registration of that id; never written anywhere else.
    admins: HashSet<String>,
}

/// Authoritative in-memory map of display clients.
///
/// Cheap to clone; all clones share the same state. Every read-modify-write
/// runs under a single write guard, so "one entry per id" and "admin index
/// mirrors capabilities" hold under the multi-threaded runtime.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    system: Arc<str>,
}

impl ClientRegistry {
    /// Create an empty registry for the named system.
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                clients: HashMap::new(),
                admins: HashSet::new(),
            })),
            system: Arc::from(system.into()),
        }
    }

    /// System name carried in acknowledgements and listings.
    pub fn system_name(&self) -> &str {
        &self.system
    }

    /// Insert or replace the entry for `registration.client_id`.
    ///
    /// A re-registration swaps the connection handle, replaces capabilities,
    /// updates the display state when one is declared, and resets the client
    /// to `online`.
    pub fn register(&self, registration: Registration) -> ServerMessage {
        let Registration {
            client_id,
            connection,
            capabilities,
            info,
            display,
        } = registration;

        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        let is_admin = capabilities.contains(ADMIN_CAPABILITY);

        let mut inner = self.inner.write();
        let display = match display {
            Some(display) => display,
            None => inner
                .clients
                .get(&client_id)
                .map(|existing| existing.display.clone())
                .unwrap_or_else(default_display),
        };
        let replaced = inner
            .clients
            .insert(
                client_id.clone(),
                ClientEntry {
                    connection,
                    capabilities,
                    info,
                    display,
                    status: ClientStatus::Online,
                    last_seen: SystemTime::now(),
                    heard_at: Instant::now(),
                },
            )
            .is_some();
        if is_admin {
            inner.admins.insert(client_id.clone());
        } else {
            inner.admins.remove(&client_id);
        }
        drop(inner);

        tracing::info!(
            client_id = %client_id,
            system = %self.system,
            admin = is_admin,
            replaced,
            "client registered"
        );

        ServerMessage::Registered {
            client_id,
            system: self.system.to_string(),
            token: None,
        }
    }

    /// Record a heartbeat: refresh `last_seen` and force `online`.
    ///
    /// Returns the status held before the heartbeat, or `None` for an
    /// unregistered id.
    pub fn touch(&self, client_id: &str) -> Option<ClientStatus> {
        self.touch_at(client_id, Instant::now())
    }

    pub fn touch_at(&self, client_id: &str, now: Instant) -> Option<ClientStatus> {
        let mut inner = self.inner.write();
        let entry = inner.clients.get_mut(client_id)?;
        let previous = entry.status;
        entry.last_seen = SystemTime::now();
        entry.heard_at = now;
        entry.status = ClientStatus::Online;
        if previous != ClientStatus::Online {
            tracing::info!(client_id = %client_id, from = %previous, "client back online");
        }
        Some(previous)
    }

    /// Merge `patch` into each registered target and push a
    /// `display_update` frame to it.
    ///
    /// Unknown targets are skipped. A failed push leaves the merged state in
    /// place and is reported as [`TargetOutcome::DeliveryFailed`].
    pub fn apply_display(&self, targets: &[String], patch: &DisplayState) -> ApplyReport {
        let frame = ServerMessage::DisplayUpdate {
            display: patch.clone(),
        };
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode display update");
                return ApplyReport::default();
            }
        };

        let mut report = ApplyReport::default();
        let mut inner = self.inner.write();
        for target in targets {
            let Some(entry) = inner.clients.get_mut(target) else {
                tracing::debug!(client_id = %target, "display update target not registered");
                report
                    .outcomes
                    .push((target.clone(), TargetOutcome::SkippedUnknown));
                continue;
            };
            merge_display(&mut entry.display, patch);
            let outcome = match entry.connection.send_text(text.clone()) {
                Ok(()) => TargetOutcome::Applied,
                Err(e) => {
                    tracing::error!(client_id = %target, error = %e, "failed to send display update");
                    TargetOutcome::DeliveryFailed
                }
            };
            report.outcomes.push((target.clone(), outcome));
        }
        report
    }

    /// Point-in-time view of every client, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, ClientSnapshot> {
        self.inner
            .read()
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect()
    }

    /// Snapshot plus the admin connections, taken under one read guard.
    pub(crate) fn snapshot_for_admins(
        &self,
    ) -> (BTreeMap<String, ClientSnapshot>, Vec<(String, ConnectionHandle)>) {
        let inner = self.inner.read();
        let snapshot = inner
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect();
        let mut admins: Vec<(String, ConnectionHandle)> = inner
            .admins
            .iter()
            .filter_map(|id| {
                inner
                    .clients
                    .get(id)
                    .map(|entry| (id.clone(), entry.connection.clone()))
            })
            .collect();
        admins.sort_by(|a, b| a.0.cmp(&b.0));
        (snapshot, admins)
    }

    /// Current display state of every client, as stored in presets.
    pub fn display_states(&self) -> BTreeMap<String, DisplayState> {
        self.inner
            .read()
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), entry.display.clone()))
            .collect()
    }

    /// Set `client_id` to `offline` regardless of its current status.
    pub fn mark_offline(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.clients.get_mut(client_id) {
            Some(entry) => {
                entry.status = ClientStatus::Offline;
                tracing::info!(client_id = %client_id, "client marked offline");
                true
            }
            None => false,
        }
    }

    /// Connection teardown: mark `client_id` offline only while the entry is
    /// still bound to `connection_id`. A client that already re-registered on
    /// a newer connection is left alone.
    pub fn release(&self, client_id: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.clients.get_mut(client_id) {
            Some(entry) if entry.connection.id() == connection_id => {
                entry.status = ClientStatus::Offline;
                tracing::info!(client_id = %client_id, "connection closed, client marked offline");
                true
            }
            _ => false,
        }
    }

    /// Demote clients whose last heartbeat is older than the thresholds.
    ///
    /// Elapsed time is measured on the monotonic clock, not `last_seen`.
    pub fn sweep(&self, now: Instant, thresholds: &Thresholds) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        let mut inner = self.inner.write();
        for (id, entry) in inner.clients.iter_mut() {
            let elapsed = now.saturating_duration_since(entry.heard_at);
            let next = liveness::next_status(entry.status, elapsed, thresholds);
            if next != entry.status {
                tracing::warn!(
                    client_id = %id,
                    from = %entry.status,
                    to = %next,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "client liveness changed"
                );
                changes.push(StatusChange {
                    client_id: id.clone(),
                    from: entry.status,
                    to: next,
                    elapsed,
                });
                entry.status = next;
            }
        }
        changes
    }

    pub fn status(&self, client_id: &str) -> Option<ClientStatus> {
        self.inner.read().clients.get(client_id).map(|e| e.status)
    }

    pub fn display(&self, client_id: &str) -> Option<DisplayState> {
        self.inner
            .read()
            .clients
            .get(client_id)
            .map(|e| e.display.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.read().clients.contains_key(client_id)
    }

    pub fn is_admin(&self, client_id: &str) -> bool {
        self.inner.read().admins.contains(client_id)
    }

    /// Sorted ids currently in the admin index.
    pub fn admin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().admins.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration(id: &str, capabilities: &[&str]) -> (Registration, mpsc::UnboundedReceiver<String>) {
        let (connection, rx) = ConnectionHandle::channel();
        let reg = Registration {
            client_id: id.to_string(),
            connection,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            info: Map::new(),
            display: Some(default_display()),
        };
        (reg, rx)
    }

    fn patch(value: serde_json::Value) -> DisplayState {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn register_acknowledges_with_system_name() {
        let reg = ClientRegistry::new("kiosk");
        let (r, _rx) = registration("a", &["display"]);
        match reg.register(r) {
            ServerMessage::Registered { client_id, system, token } => {
                assert_eq!(client_id, "a");
                assert_eq!(system, "kiosk");
                assert!(token.is_none());
            }
            other => panic!("unexpected ack: {:?}", other),
        }
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));
    }

    #[test]
    fn reregistration_replaces_single_entry() {
        let reg = ClientRegistry::new("hub");
        let (first, _rx1) = registration("a", &["display"]);
        reg.register(first);
        reg.mark_offline("a");

        let (mut second, _rx2) = registration("a", &["display"]);
        second.display.as_mut().unwrap().insert("number".into(), json!("7"));
        reg.register(second);

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));
        assert_eq!(reg.display("a").unwrap()["number"], "7");
    }

    #[test]
    fn reregistration_without_display_keeps_state() {
        let reg = ClientRegistry::new("hub");
        let (first, _rx1) = registration("a", &[]);
        reg.register(first);
        reg.apply_display(&["a".to_string()], &patch(json!({"background": "#00ff00"})));

        let (mut second, _rx2) = registration("a", &[]);
        second.display = None;
        reg.register(second);
        assert_eq!(reg.display("a").unwrap()["background"], "#00ff00");

        let (mut fresh, _rx3) = registration("b", &[]);
        fresh.display = None;
        reg.register(fresh);
        assert_eq!(reg.display("b").unwrap(), default_display());
    }

    #[test]
    fn admin_index_follows_capabilities() {
        let reg = ClientRegistry::new("hub");
        let (r, _rx) = registration("op", &["admin"]);
        reg.register(r);
        assert!(reg.is_admin("op"));

        let (r, _rx2) = registration("op", &["display"]);
        reg.register(r);
        assert!(!reg.is_admin("op"));
        assert!(reg.admin_ids().is_empty());
    }

    #[test]
    fn apply_display_skips_unregistered_targets() {
        let reg = ClientRegistry::new("hub");
        let (r, mut rx) = registration("A", &[]);
        reg.register(r);

        let report = reg.apply_display(
            &["A".to_string(), "C".to_string()],
            &patch(json!({"background": "#ff0000"})),
        );
        assert_eq!(report.updated_ids(), vec!["A".to_string()]);
        assert_eq!(
            report.outcomes[1],
            ("C".to_string(), TargetOutcome::SkippedUnknown)
        );
        assert_eq!(reg.display("A").unwrap()["background"], "#ff0000");
        assert!(!reg.contains("C"));

        let pushed: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(pushed["type"], "display_update");
        assert_eq!(pushed["display"], json!({"background": "#ff0000"}));
    }

    #[test]
    fn failed_delivery_keeps_state_change() {
        let reg = ClientRegistry::new("hub");
        let (r, rx) = registration("A", &[]);
        reg.register(r);
        drop(rx);

        let report = reg.apply_display(&["A".to_string()], &patch(json!({"number": "3"})));
        assert!(report.updated_ids().is_empty());
        assert_eq!(
            report.outcomes,
            vec![("A".to_string(), TargetOutcome::DeliveryFailed)]
        );
        assert_eq!(reg.display("A").unwrap()["number"], "3");
    }

    #[test]
    fn release_ignores_superseded_connection() {
        let reg = ClientRegistry::new("hub");
        let (first, _rx1) = registration("a", &[]);
        let old_connection = first.connection.id().to_string();
        reg.register(first);

        let (second, _rx2) = registration("a", &[]);
        let new_connection = second.connection.id().to_string();
        reg.register(second);

        assert!(!reg.release("a", &old_connection));
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));
        assert!(reg.release("a", &new_connection));
        assert_eq!(reg.status("a"), Some(ClientStatus::Offline));
    }

    #[test]
    fn mark_offline_unknown_id_is_noop() {
        let reg = ClientRegistry::new("hub");
        assert!(!reg.mark_offline("ghost"));
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_demotes_after_thresholds() {
        let reg = ClientRegistry::new("hub");
        let (r, _rx) = registration("a", &[]);
        reg.register(r);
        let base = Instant::now();
        reg.touch_at("a", base);
        let thresholds = Thresholds::default();

        assert!(reg.sweep(base + Duration::from_secs(5), &thresholds).is_empty());

        let changes = reg.sweep(base + Duration::from_secs(15), &thresholds);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from, ClientStatus::Online);
        assert_eq!(changes[0].to, ClientStatus::Lost);
        assert_eq!(reg.status("a"), Some(ClientStatus::Lost));

        let changes = reg.sweep(base + Duration::from_secs(65), &thresholds);
        assert_eq!(changes[0].to, ClientStatus::Offline);
        assert_eq!(reg.status("a"), Some(ClientStatus::Offline));

        // Already offline: nothing further to report.
        assert!(reg.sweep(base + Duration::from_secs(120), &thresholds).is_empty());
    }

    #[test]
    fn single_sweep_after_long_silence_ends_offline() {
        let reg = ClientRegistry::new("hub");
        let (r, _rx) = registration("a", &[]);
        reg.register(r);
        let base = Instant::now();
        reg.touch_at("a", base);

        let changes = reg.sweep(base + Duration::from_secs(65), &Thresholds::default());
        assert_eq!(changes.len(), 1);
        assert_eq!(reg.status("a"), Some(ClientStatus::Offline));
    }

    #[test]
    fn sweep_uses_monotonic_heartbeat_time() {
        let reg = ClientRegistry::new("hub");
        let (r, _rx) = registration("a", &[]);
        reg.register(r);
        let base = Instant::now();
        reg.touch_at("a", base + Duration::from_secs(30));
        let reported = reg.snapshot()["a"].last_seen;

        // A sweep instant before the heartbeat counts as zero elapsed.
        assert!(reg.sweep(base, &Thresholds::default()).is_empty());
        assert!(reg.sweep(base + Duration::from_secs(35), &Thresholds::default()).is_empty());
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));
        assert_eq!(reg.snapshot()["a"].last_seen, reported);

        let changes = reg.sweep(base + Duration::from_secs(45), &Thresholds::default());
        assert_eq!(changes[0].to, ClientStatus::Lost);
    }

    #[test]
    fn heartbeat_revives_from_any_status() {
        let reg = ClientRegistry::new("hub");
        let (r, _rx) = registration("a", &[]);
        reg.register(r);

        reg.mark_offline("a");
        assert_eq!(reg.touch("a"), Some(ClientStatus::Offline));
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));

        let base = Instant::now();
        reg.touch_at("a", base);
        reg.sweep(base + Duration::from_secs(15), &Thresholds::default());
        assert_eq!(reg.touch_at("a", base + Duration::from_secs(16)), Some(ClientStatus::Lost));
        assert_eq!(reg.status("a"), Some(ClientStatus::Online));
    }

    #[test]
    fn touch_unknown_client_returns_none() {
        let reg = ClientRegistry::new("hub");
        assert_eq!(reg.touch("nobody"), None);
    }

    #[test]
    fn snapshot_reports_every_client() {
        let reg = ClientRegistry::new("hub");
        let (mut r, _rx) = registration("a", &["display", "image"]);
        r.info.insert("name".into(), json!("Display-1"));
        reg.register(r);

        let snapshot = reg.snapshot();
        let entry = &snapshot["a"];
        assert_eq!(entry.status, ClientStatus::Online);
        assert_eq!(entry.capabilities, vec!["display", "image"]);
        assert_eq!(entry.info["name"], "Display-1");
        assert_eq!(entry.display["mode"], "color");
        assert!(entry.last_seen > 0);
    }
}
