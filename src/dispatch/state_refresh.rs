// src/dispatch/state_refresh.rs - Periodic device state polling
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::command::Command;
use crate::controller::{ControllerKind, ControllerRegistry};
use crate::device::DeviceArena;
use crate::diagnostics::DiagnosticLog;

const SOURCE: &str = "state_refresh";

/// What one refresh pass did with each controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    /// Lock held by an executing command
    pub skipped_busy: Vec<String>,
    pub skipped_disconnected: Vec<String>,
    /// Errors and timeouts; logged, never propagated
    pub failed: Vec<String>,
}

enum Outcome {
    Refreshed,
    Busy,
    Disconnected,
    Failed,
}

/// Poll every leaf controller once.
///
/// A controller is skipped when its lock is held or one of its devices is
/// disconnected. Each poll gets `limit` before it is abandoned.
pub async fn update_states(
    registry: &ControllerRegistry,
    arena: &DeviceArena,
    diagnostics: &DiagnosticLog,
    limit: Duration,
) -> RefreshReport {
    let polls = registry
        .handles()
        .iter()
        .filter(|handle| handle.kind() != ControllerKind::Master)
        .map(|handle| async move {
            let name = handle.name().to_string();
            if !arena.all_connected(handle.devices()) {
                return (name, Outcome::Disconnected);
            }
            let Some(guard) = handle.try_lock() else {
                return (name, Outcome::Busy);
            };
            let command = match Command::update_state(handle.name(), Vec::new()) {
                Ok(command) => command,
                Err(e) => {
                    diagnostics.warn(SOURCE, format!("{}: {}", name, e));
                    return (name, Outcome::Failed);
                }
            };
            // The guard lives inside the timed future so an abandoned poll releases the lock
            let poll = async move {
                let result = handle.execute_locked(&guard, &command).await;
                drop(guard);
                result
            };
            match timeout(limit, poll).await {
                Ok(Ok(_)) => (name, Outcome::Refreshed),
                Ok(Err(e)) => {
                    diagnostics.warn(SOURCE, format!("{}: state update failed: {}", name, e));
                    (name, Outcome::Failed)
                }
                Err(_) => {
                    diagnostics.warn(SOURCE, format!("{}: state update timed out after {:?}", name, limit));
                    (name, Outcome::Failed)
                }
            }
        });

    let mut report = RefreshReport::default();
    for (name, outcome) in join_all(polls).await {
        match outcome {
            Outcome::Refreshed => report.refreshed.push(name),
            Outcome::Busy => report.skipped_busy.push(name),
            Outcome::Disconnected => report.skipped_disconnected.push(name),
            Outcome::Failed => report.failed.push(name),
        }
    }
    tracing::trace!("State refresh: {:?}", report);
    report
}

/// Run [`update_states`] every `period` until shutdown. A zero period disables polling.
pub fn spawn_state_refresh(
    registry: Arc<ControllerRegistry>,
    arena: Arc<DeviceArena>,
    diagnostics: DiagnosticLog,
    period: Duration,
    limit: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        tracing::info!("Periodic state refresh disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    update_states(&registry, &arena, &diagnostics, limit).await;
                }
            }
        }
        tracing::debug!("State refresh task stopped");
    }))
}
