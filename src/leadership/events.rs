//! Leadership Events
//!
//! Transition records published by [`super::LeadershipState`] and a logging observer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why an instance stopped being the maintenance manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossReason {
    /// Tenure reached the voluntary-yield interval
    Voluntary,
    /// Verification found the advisory lock held elsewhere
    LockLost,
    /// An unexpected error forced demotion
    Error,
    /// The elector was cancelled
    Shutdown,
    /// A collaborator released the role explicitly
    ManualRelease,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::Voluntary => "voluntary",
            LossReason::LockLost => "lock-lost",
            LossReason::Error => "error",
            LossReason::Shutdown => "shutdown",
            LossReason::ManualRelease => "manual-release",
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single leadership transition. Exactly one is published per real transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LeadershipEvent {
    LeaderElected {
        instance_id: String,
        elected_at: DateTime<Utc>,
    },
    LeaderLost {
        instance_id: String,
        lost_at: DateTime<Utc>,
        reason: LossReason,
    },
}

impl LeadershipEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            LeadershipEvent::LeaderElected { instance_id, .. }
            | LeadershipEvent::LeaderLost { instance_id, .. } => instance_id,
        }
    }

    pub fn is_elected(&self) -> bool {
        matches!(self, LeadershipEvent::LeaderElected { .. })
    }

    /// The loss reason, or `None` for an election.
    pub fn reason(&self) -> Option<LossReason> {
        match self {
            LeadershipEvent::LeaderLost { reason, .. } => Some(*reason),
            LeadershipEvent::LeaderElected { .. } => None,
        }
    }
}

/// Spawns an observer that writes every transition to the log.
///
/// The observer runs in its own task, so a slow or failing observer never
/// affects the publisher. Lagging only drops log lines. Events already queued
/// when `cancel` fires are still logged, so cancel it only after the elector
/// has stopped publishing.
pub fn spawn_event_logger(
    mut events: broadcast::Receiver<LeadershipEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = cancel.cancelled() => break,
            };

            match event {
                Ok(LeadershipEvent::LeaderElected {
                    instance_id,
                    elected_at,
                }) => {
                    info!(%instance_id, %elected_at, "Instance became maintenance manager");
                }
                Ok(LeadershipEvent::LeaderLost {
                    instance_id,
                    lost_at,
                    reason,
                }) => {
                    info!(%instance_id, %lost_at, %reason, "Instance lost maintenance manager role");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Leadership event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Leadership event logger stopped");
    })
}
