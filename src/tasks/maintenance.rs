//! Expired-Item Maintenance Task
//!
//! Background task that periodically deletes expired cache entries in bounded
//! batches. With coordination enabled only the elected manager runs the delete.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ExpiredItemRemover;
use crate::config::MaintenanceConfig;
use crate::error::CoordinationError;
use crate::leadership::LeadershipState;

/// Decides whether this instance may run maintenance on a given tick.
#[derive(Debug, Clone)]
pub enum MaintenanceGate {
    /// Run only while the leadership state says this instance leads
    Leadership(Arc<LeadershipState>),
    /// Coordination disabled: every instance runs maintenance
    Uncoordinated,
}

impl MaintenanceGate {
    async fn permits(&self, cancel: &CancellationToken) -> Result<bool, CoordinationError> {
        match self {
            MaintenanceGate::Leadership(state) => Ok(state.snapshot(cancel).await?.is_leader),
            MaintenanceGate::Uncoordinated => Ok(true),
        }
    }
}

/// Result of a single maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance is the manager
    Skipped,
    /// The delete ran and removed this many entries
    Completed(u64),
    /// The delete or the leadership read failed; the next tick retries
    Failed,
    /// Shutdown interrupted the tick
    Cancelled,
}

// == Maintenance Scheduler ==
pub struct MaintenanceScheduler {
    gate: MaintenanceGate,
    remover: Arc<dyn ExpiredItemRemover>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(
        gate: MaintenanceGate,
        remover: Arc<dyn ExpiredItemRemover>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            gate,
            remover,
            config,
        }
    }

    /// Runs one tick. Never fails: errors are logged and reported as an outcome.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TickOutcome {
        match self.gate.permits(cancel).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Not the maintenance manager, skipping expired-item cleanup");
                return TickOutcome::Skipped;
            }
            Err(CoordinationError::Cancelled) => return TickOutcome::Cancelled,
            Err(e) => {
                warn!(error = %e, "Could not read leadership state, skipping expired-item cleanup");
                return TickOutcome::Failed;
            }
        }

        let now = Utc::now();
        let batch_size = self.config.batch_size;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Expired-item cleanup interrupted by shutdown");
                return TickOutcome::Cancelled;
            }
            result = self.remover.delete_expired(now, batch_size) => result,
        };

        match result {
            Ok(0) => {
                debug!("Expired-item cleanup: no expired entries found");
                TickOutcome::Completed(0)
            }
            Ok(removed) => {
                info!(removed, batch_size, "Expired-item cleanup removed expired entries");
                TickOutcome::Completed(removed)
            }
            Err(e) => {
                error!(error = %e, "Expired-item cleanup failed, retrying on the next tick");
                TickOutcome::Failed
            }
        }
    }

    /// Ticks every `interval` until `cancel` fires. The first tick runs one
    /// interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting expired-item maintenance task"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() completes its first tick immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.run_once(&cancel).await == TickOutcome::Cancelled {
                break;
            }
        }

        info!("Expired-item maintenance task stopped");
    }
}

/// Spawns the maintenance loop. It stops when `cancel` fires.
pub fn spawn_maintenance_task(
    scheduler: Arc<MaintenanceScheduler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move { scheduler.run(cancel).await })
}
