//! Leadership State Module
//!
//! In-process record of whether this instance is the maintenance manager.
//! All reads and writes go through one async exclusion; transitions are
//! published on a broadcast channel once the exclusion is released.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::events::{LeadershipEvent, LossReason};
use crate::error::CoordinationError;

/// Capacity of the transition channel. Slow subscribers observe `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// == Snapshot ==
/// Consistent copy of the leadership fields taken under the exclusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeadershipSnapshot {
    pub is_leader: bool,
    pub elected_at: Option<DateTime<Utc>>,
    pub lost_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LeadershipRecord {
    is_leader: bool,
    elected_at: Option<DateTime<Utc>>,
    lost_at: Option<DateTime<Utc>>,
}

// == Leadership State ==
/// Concurrency-safe leadership record for one instance.
#[derive(Debug)]
pub struct LeadershipState {
    instance_id: String,
    record: Mutex<LeadershipRecord>,
    disposed: CancellationToken,
    events: broadcast::Sender<LeadershipEvent>,
}

impl LeadershipState {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            record: Mutex::new(LeadershipRecord::default()),
            disposed: CancellationToken::new(),
            events,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribes to transitions published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.events.subscribe()
    }

    // == Exclusion ==
    /// Acquires the exclusion guarding the record.
    ///
    /// Fails with `Cancelled` if `cancel` fires first and with `Disposed` if the
    /// state is (or becomes) disposed while waiting. Transitions made through
    /// the returned guard are published when it is dropped.
    pub async fn lock(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeadershipGuard<'_>, CoordinationError> {
        if self.disposed.is_cancelled() {
            return Err(CoordinationError::Disposed);
        }

        let record = tokio::select! {
            biased;
            _ = self.disposed.cancelled() => return Err(CoordinationError::Disposed),
            _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
            record = self.record.lock() => record,
        };

        // dispose() may have run while we were queued behind another holder
        if self.disposed.is_cancelled() {
            return Err(CoordinationError::Disposed);
        }

        Ok(LeadershipGuard {
            state: self,
            record,
            pending: Vec::new(),
        })
    }

    // == Transitions ==
    /// Marks this instance as leader. Returns false if it already was.
    pub async fn become_leader(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let mut guard = self.lock(cancel).await?;
        Ok(guard.become_leader(now))
    }

    /// Marks this instance as no longer leader. Returns false if it was not leading.
    pub async fn lose_leadership(
        &self,
        now: DateTime<Utc>,
        reason: LossReason,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let mut guard = self.lock(cancel).await?;
        Ok(guard.lose_leadership(now, reason))
    }

    pub async fn snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeadershipSnapshot, CoordinationError> {
        let guard = self.lock(cancel).await?;
        Ok(guard.snapshot())
    }

    /// Runs `mutator` under the same exclusion as the transitions.
    ///
    /// The exclusion is released even if `mutator` panics.
    pub async fn update_atomic<F, R>(
        &self,
        cancel: &CancellationToken,
        mutator: F,
    ) -> Result<R, CoordinationError>
    where
        F: FnOnce(&mut LeadershipGuard<'_>) -> R,
    {
        let mut guard = self.lock(cancel).await?;
        Ok(mutator(&mut guard))
    }

    // == Disposal ==
    /// Fails every current waiter and all later calls with `Disposed`. Idempotent.
    pub fn dispose(&self) {
        self.disposed.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }
}

// == Leadership Guard ==
/// Exclusive access to the leadership record.
#[derive(Debug)]
pub struct LeadershipGuard<'a> {
    state: &'a LeadershipState,
    record: MutexGuard<'a, LeadershipRecord>,
    pending: Vec<LeadershipEvent>,
}

impl LeadershipGuard<'_> {
    pub fn is_leader(&self) -> bool {
        self.record.is_leader
    }

    pub fn instance_id(&self) -> &str {
        &self.state.instance_id
    }

    pub fn snapshot(&self) -> LeadershipSnapshot {
        LeadershipSnapshot {
            is_leader: self.record.is_leader,
            elected_at: self.record.elected_at,
            lost_at: self.record.lost_at,
        }
    }

    /// Returns true if this call performed the transition.
    pub fn become_leader(&mut self, now: DateTime<Utc>) -> bool {
        if self.record.is_leader {
            return false;
        }

        // lostAt must stay strictly before the new electedAt
        let elected_at = match self.record.lost_at {
            Some(lost_at) if now <= lost_at => lost_at + ChronoDuration::microseconds(1),
            _ => now,
        };

        self.record.is_leader = true;
        self.record.elected_at = Some(elected_at);
        self.pending.push(LeadershipEvent::LeaderElected {
            instance_id: self.state.instance_id.clone(),
            elected_at,
        });
        true
    }

    /// Returns true if this call performed the transition.
    pub fn lose_leadership(&mut self, now: DateTime<Utc>, reason: LossReason) -> bool {
        if !self.record.is_leader {
            return false;
        }

        let lost_at = match self.record.elected_at {
            Some(elected_at) if now < elected_at => elected_at,
            _ => now,
        };

        self.record.is_leader = false;
        self.record.lost_at = Some(lost_at);
        self.pending.push(LeadershipEvent::LeaderLost {
            instance_id: self.state.instance_id.clone(),
            lost_at,
            reason,
        });
        true
    }
}

impl Drop for LeadershipGuard<'_> {
    fn drop(&mut self) {
        for event in self.pending.drain(..) {
            // no subscribers is fine
            let _ = self.state.events.send(event);
        }
    }
}
