//! Fan-out of registry snapshots to admin observers.

use crate::protocol::ServerMessage;
use crate::registry::ClientRegistry;

/// Which admins a broadcast reached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Send the full registry snapshot as a `client_list` frame to every client
/// currently in the admin index.
///
/// Fire-and-forget: a failed send is logged and the remaining admins still
/// receive the frame. The admin set is read at call time, so an admin
/// registered afterwards only sees later broadcasts.
pub fn broadcast_snapshot(registry: &ClientRegistry) -> BroadcastReport {
    let (clients, admins) = registry.snapshot_for_admins();
    let mut report = BroadcastReport::default();
    if admins.is_empty() {
        return report;
    }

    let msg = ServerMessage::ClientList {
        clients,
        system: registry.system_name().to_string(),
    };
    let text = match msg.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode client list broadcast");
            return report;
        }
    };

    for (id, connection) in admins {
        match connection.send_text(text.clone()) {
            Ok(()) => report.delivered.push(id),
            Err(e) => {
                tracing::error!(client_id = %id, error = %e, "failed to broadcast status to admin");
                report.failed.push(id);
            }
        }
    }
    tracing::debug!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "client list broadcast"
    );
    report
}
