//! Heartbeat-driven liveness tracking.
//!
//! Clients move `online -> lost -> offline` as their last heartbeat ages. A
//! heartbeat or re-registration puts them back to `online` from any state;
//! that path lives in [`ClientRegistry::touch`] and
//! [`ClientRegistry::register`].

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::broadcast_snapshot;
use crate::protocol::ClientStatus;
use crate::registry::ClientRegistry;

/// Silence limits for the status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// `online` clients silent for longer than this become `lost`.
    pub lost_after: Duration,
    /// Clients silent for longer than this become `offline`.
    pub offline_after: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lost_after: Duration::from_secs(10),
            offline_after: Duration::from_secs(60),
        }
    }
}

/// Status a client should hold after `elapsed` without a heartbeat.
///
/// Steps are applied in order so a long silence walks an `online` client
/// through `lost` to `offline` within one evaluation. The result never moves
/// backwards along the chain.
pub fn next_status(current: ClientStatus, elapsed: Duration, thresholds: &Thresholds) -> ClientStatus {
    let mut status = current;
    if status == ClientStatus::Online && elapsed > thresholds.lost_after {
        status = ClientStatus::Lost;
    }
    if status != ClientStatus::Offline && elapsed > thresholds.offline_after {
        status = ClientStatus::Offline;
    }
    status
}

/// Run one sweep and broadcast once if anything changed.
///
/// Returns the number of clients whose status changed.
pub fn sweep_and_broadcast(registry: &ClientRegistry, thresholds: &Thresholds, now: Instant) -> usize {
    let changes = registry.sweep(now, thresholds);
    if !changes.is_empty() {
        broadcast_snapshot(registry);
    }
    changes.len()
}

/// Periodic sweeper over a [`ClientRegistry`].
pub struct LivenessMonitor {
    registry: ClientRegistry,
    thresholds: Thresholds,
    period: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: ClientRegistry, thresholds: Thresholds, period: Duration) -> Self {
        Self {
            registry,
            thresholds,
            period,
        }
    }

    /// Spawn the sweep loop. It exits between sweeps once `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(period_secs = self.period.as_secs_f64(), "liveness monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_and_broadcast(&self.registry, &self.thresholds, Instant::now());
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("liveness monitor stopping");
                    return;
                }
            }
        }
    }
}
