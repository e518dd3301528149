//! Leader Elector
//!
//! Background loop that competes for the maintenance manager role by taking a
//! session-level advisory lock, verifies the lock while leading, and steps down
//! voluntarily after a full tenure so other instances get a turn.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::events::LossReason;
use super::state::{LeadershipGuard, LeadershipState};
use crate::config::ElectionConfig;
use crate::error::{CoordinationError, LockError};
use crate::lock::{LockProvider, LockSession};

/// The held advisory lock. Only touched while the leadership exclusion is held.
#[derive(Default)]
struct LockHandle {
    session: Option<Box<dyn LockSession>>,
    tenure_started: Option<Instant>,
}

// == Leader Elector ==
/// Competes for one advisory lock key on behalf of one [`LeadershipState`].
pub struct LeaderElector {
    state: Arc<LeadershipState>,
    provider: Arc<dyn LockProvider>,
    lock_key: i64,
    config: ElectionConfig,
    handle: Mutex<LockHandle>,
}

impl LeaderElector {
    pub fn new(
        state: Arc<LeadershipState>,
        provider: Arc<dyn LockProvider>,
        lock_key: i64,
        config: ElectionConfig,
    ) -> Self {
        Self {
            state,
            provider,
            lock_key,
            config,
            handle: Mutex::new(LockHandle::default()),
        }
    }

    pub fn state(&self) -> &Arc<LeadershipState> {
        &self.state
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    // == Manual Role Control ==
    /// Tries once to become the maintenance manager.
    ///
    /// Returns `Ok(true)` straight away, without touching the lock, if this
    /// instance already leads. Contention and lock failures yield `Ok(false)`;
    /// only cancellation and disposal are returned as errors.
    pub async fn try_acquire_manager_role(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let mut guard = self.state.lock(cancel).await?;
        if guard.is_leader() {
            return Ok(true);
        }

        let mut handle = self.handle.lock().await;
        self.acquire(&mut guard, &mut handle, cancel).await
    }

    /// Gives up the manager role if held. No-op otherwise.
    pub async fn release_manager_role(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinationError> {
        let mut guard = self.state.lock(cancel).await?;
        if !guard.is_leader() {
            return Ok(());
        }

        let mut handle = self.handle.lock().await;
        self.release(&mut guard, &mut handle, LossReason::ManualRelease)
            .await;
        Ok(())
    }

    // == Election Loop ==
    /// Runs until `cancel` fires, then releases the lock if held.
    pub async fn run(&self, cancel: CancellationToken) {
        let instance_id = self.state.instance_id().to_string();
        let mut backoff = BackoffPolicy::for_instance(&self.config, &instance_id);
        let mut attempt: u32 = 0;

        info!(%instance_id, lock_key = self.lock_key, "Leader election loop started");

        loop {
            let delay = match self.step(&mut attempt, &mut backoff, &cancel).await {
                Ok(delay) => delay,
                Err(CoordinationError::Cancelled) => break,
                Err(CoordinationError::Disposed) => {
                    error!(%instance_id, "Leadership state disposed under a running election loop");
                    self.abandon_session().await;
                    return;
                }
                Err(CoordinationError::Lock(e)) => {
                    warn!(%instance_id, error = %e, kind = e.kind(), "Leader election iteration failed");
                    self.demote(LossReason::Error, &cancel).await;
                    attempt = 0;
                    self.config.error_retry_delay
                }
            };

            if sleep_or_cancel(delay, &cancel).await.is_err() {
                break;
            }
        }

        self.shutdown().await;
        info!(%instance_id, "Leader election loop stopped");
    }

    /// One loop iteration. Returns how long to wait before the next one.
    async fn step(
        &self,
        attempt: &mut u32,
        backoff: &mut BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<Duration, CoordinationError> {
        let mut guard = self.state.lock(cancel).await?;
        let mut handle = self.handle.lock().await;

        if !guard.is_leader() {
            if self.acquire(&mut guard, &mut handle, cancel).await? {
                *attempt = 0;
                return Ok(self.config.heartbeat_interval);
            }

            *attempt = attempt.saturating_add(1);
            let delay = backoff.delay(*attempt);
            debug!(
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                "Manager role not acquired, backing off"
            );
            return Ok(delay);
        }

        let tenure = handle
            .tenure_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        if tenure >= self.config.voluntary_yield_interval {
            info!(
                tenure_ms = tenure.as_millis() as u64,
                "Yielding manager role after a full tenure"
            );
            self.release(&mut guard, &mut handle, LossReason::Voluntary)
                .await;
            *attempt = 0;
            return Ok(self.config.yield_window);
        }

        match self.verify(&mut handle, cancel).await {
            Ok(true) => {
                let until_yield = self.config.voluntary_yield_interval - tenure;
                Ok(self.config.heartbeat_interval.min(until_yield))
            }
            Ok(false) => {
                warn!(lock_key = self.lock_key, "Advisory lock no longer held, stepping down");
                self.release(&mut guard, &mut handle, LossReason::LockLost)
                    .await;
                *attempt = 0;
                Ok(Duration::ZERO)
            }
            Err(CoordinationError::Lock(e)) => {
                warn!(error = %e, kind = e.kind(), "Advisory lock verification failed, stepping down");
                self.release(&mut guard, &mut handle, LossReason::Error)
                    .await;
                *attempt = 0;
                Ok(self.config.error_retry_delay)
            }
            Err(other) => Err(other),
        }
    }

    // == Lock Operations ==
    /// Opens a session and tries the lock. Keeps the session only on success.
    async fn acquire(
        &self,
        guard: &mut LeadershipGuard<'_>,
        handle: &mut LockHandle,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        if let Some(stale) = handle.session.take() {
            stale.close().await;
        }

        let mut session = match cancellable(cancel, self.provider.open_session()).await? {
            Ok(session) => session,
            Err(e) => {
                self.log_acquire_failure(&e);
                return Ok(false);
            }
        };

        let outcome = cancellable(
            cancel,
            session.try_acquire(self.lock_key, self.config.acquire_timeout),
        )
        .await;

        match outcome {
            Ok(Ok(true)) => {
                handle.session = Some(session);
                handle.tenure_started = Some(Instant::now());
                guard.become_leader(Utc::now());
                Ok(true)
            }
            Ok(Ok(false)) => {
                session.close().await;
                Ok(false)
            }
            Ok(Err(e)) => {
                self.log_acquire_failure(&e);
                session.close().await;
                Ok(false)
            }
            Err(cancelled) => {
                // closing the session frees a grant that may have landed
                session.close().await;
                Err(cancelled)
            }
        }
    }

    /// Re-enters the lock on the held session to prove it is still ours, then
    /// drops the extra grant.
    async fn verify(
        &self,
        handle: &mut LockHandle,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinationError> {
        let Some(session) = handle.session.as_mut() else {
            return Ok(false);
        };

        let held = cancellable(
            cancel,
            session.try_acquire(self.lock_key, self.config.acquire_timeout),
        )
        .await??;
        if held {
            cancellable(cancel, session.release(self.lock_key)).await??;
        }
        Ok(held)
    }

    /// Best-effort unlock and close, then records the loss.
    async fn release(
        &self,
        guard: &mut LeadershipGuard<'_>,
        handle: &mut LockHandle,
        reason: LossReason,
    ) {
        if let Some(mut session) = handle.session.take() {
            let timeout = self.config.acquire_timeout;
            match tokio::time::timeout(timeout, session.release(self.lock_key)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => debug!(lock_key = self.lock_key, "Advisory lock was not held at release"),
                Ok(Err(e)) => warn!(error = %e, %reason, "Advisory lock release failed; closing the session frees it"),
                Err(_) => warn!(?timeout, %reason, "Advisory lock release timed out"),
            }
            if tokio::time::timeout(timeout, session.close()).await.is_err() {
                warn!(?timeout, "Closing the lock session timed out");
            }
        }
        handle.tenure_started = None;
        guard.lose_leadership(Utc::now(), reason);
    }

    /// Demotes after an error escaped an iteration.
    async fn demote(&self, reason: LossReason, cancel: &CancellationToken) {
        let Ok(mut guard) = self.state.lock(cancel).await else {
            return;
        };
        if guard.is_leader() {
            let mut handle = self.handle.lock().await;
            self.release(&mut guard, &mut handle, reason).await;
        }
    }

    async fn shutdown(&self) {
        // the loop token is already cancelled, so wait on a fresh one bounded by the timeout
        let fresh = CancellationToken::new();
        let locked = tokio::time::timeout(self.config.acquire_timeout, self.state.lock(&fresh)).await;

        match locked {
            Ok(Ok(mut guard)) => {
                let mut handle = self.handle.lock().await;
                if guard.is_leader() {
                    self.release(&mut guard, &mut handle, LossReason::Shutdown)
                        .await;
                } else if let Some(stale) = handle.session.take() {
                    stale.close().await;
                }
            }
            Ok(Err(_)) => self.abandon_session().await,
            Err(_) => warn!("Timed out waiting for leadership state during shutdown"),
        }
    }

    /// Closes the session without touching the (disposed) state.
    async fn abandon_session(&self) {
        let session = self.handle.lock().await.session.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn log_acquire_failure(&self, err: &LockError) {
        let instance_id = self.state.instance_id();
        if err.is_permission_denied() {
            error!(
                %instance_id,
                lock_key = self.lock_key,
                error = %err,
                "Permission denied taking the maintenance advisory lock. Grant the cache role \
                 EXECUTE on pg_try_advisory_lock(bigint) and pg_advisory_unlock(bigint), or set \
                 COORDINATION_ENABLED=false to run expired-item cleanup on every instance"
            );
        } else {
            warn!(
                %instance_id,
                lock_key = self.lock_key,
                error = %err,
                kind = err.kind(),
                "Failed to acquire maintenance advisory lock"
            );
        }
    }
}

/// Spawns the election loop. It stops and releases the lock when `cancel` fires.
pub fn spawn_leader_elector(
    elector: Arc<LeaderElector>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move { elector.run(cancel).await })
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, CoordinationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
        output = fut => Ok(output),
    }
}

async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), CoordinationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
