//! In-Memory Lock Provider
//!
//! Mirrors Postgres session-lock semantics inside one process: grants are
//! re-entrant per session and vanish with the session. Fault hooks let tests
//! deny permissions, steal a lock or kill every open connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{LockProvider, LockSession};
use crate::error::LockError;

/// Session id owning keys handed out by [`MemoryLockProvider::steal`].
const FOREIGN_SESSION: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct Grant {
    session: u64,
    count: u32,
}

#[derive(Debug, Default)]
struct Registry {
    grants: HashMap<i64, Grant>,
    live: HashSet<u64>,
    severed: HashSet<u64>,
    next_session: u64,
    deny_permissions: bool,
    acquire_calls: u64,
}

impl Registry {
    fn release_all(&mut self, session: u64) {
        self.grants.retain(|_, grant| grant.session != session);
    }

    fn check(&self, session: u64, function: &str) -> Result<(), LockError> {
        if self.severed.contains(&session) {
            return Err(LockError::Connection(
                "terminating connection due to administrator command".to_string(),
            ));
        }
        if self.deny_permissions {
            return Err(LockError::PermissionDenied(format!(
                "permission denied for function {}",
                function
            )));
        }
        Ok(())
    }
}

/// Shared in-process lock table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later acquire and release fail with `PermissionDenied`.
    pub fn deny_permissions(&self, deny: bool) {
        self.registry().deny_permissions = deny;
    }

    /// Hands `key` to a session outside this process, as if the holder's
    /// connection had been replaced behind its back.
    pub fn steal(&self, key: i64) {
        self.registry().grants.insert(
            key,
            Grant {
                session: FOREIGN_SESSION,
                count: 1,
            },
        );
    }

    /// Frees `key` if a foreign session holds it.
    pub fn return_stolen(&self, key: i64) {
        let mut registry = self.registry();
        if matches!(registry.grants.get(&key), Some(grant) if grant.session == FOREIGN_SESSION) {
            registry.grants.remove(&key);
        }
    }

    /// Terminates every open session: their locks are freed and any further
    /// call on them fails with a connection error.
    pub fn sever_sessions(&self) {
        let mut registry = self.registry();
        let live: Vec<u64> = registry.live.drain().collect();
        for session in live {
            registry.release_all(session);
            registry.severed.insert(session);
        }
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.registry().grants.contains_key(&key)
    }

    /// Number of `try_acquire` calls made through any session.
    pub fn acquire_calls(&self) -> u64 {
        self.registry().acquire_calls
    }

    pub fn open_sessions(&self) -> usize {
        self.registry().live.len()
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        let mut registry = self.registry();
        let id = registry.next_session;
        registry.next_session += 1;
        registry.live.insert(id);

        Ok(Box::new(MemorySession {
            id,
            provider: self.clone(),
        }))
    }
}

struct MemorySession {
    id: u64,
    provider: MemoryLockProvider,
}

#[async_trait]
impl LockSession for MemorySession {
    async fn try_acquire(&mut self, key: i64, _timeout: Duration) -> Result<bool, LockError> {
        let mut registry = self.provider.registry();
        registry.acquire_calls += 1;
        registry.check(self.id, "pg_try_advisory_lock")?;

        match registry.grants.get_mut(&key) {
            Some(grant) if grant.session == self.id => {
                grant.count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                registry.grants.insert(
                    key,
                    Grant {
                        session: self.id,
                        count: 1,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&mut self, key: i64) -> Result<bool, LockError> {
        let mut registry = self.provider.registry();
        registry.check(self.id, "pg_advisory_unlock")?;

        match registry.grants.get_mut(&key) {
            Some(grant) if grant.session == self.id => {
                grant.count -= 1;
                if grant.count == 0 {
                    registry.grants.remove(&key);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(self: Box<Self>) {}
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut registry = self.provider.registry();
        registry.release_all(self.id);
        registry.live.remove(&self.id);
        registry.severed.remove(&self.id);
    }
}
