//! External Lock Module
//!
//! Session-scoped advisory locks addressed by a 64-bit key.
//!
//! # Providers
//! - [`PgAdvisoryLock`]: `pg_try_advisory_lock` over a dedicated Postgres connection
//! - [`MemoryLockProvider`]: in-process provider with the same session semantics

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

pub use memory::MemoryLockProvider;
pub use postgres::{classify_sqlx_error, PgAdvisoryLock};

/// Opens lock sessions. One session corresponds to one dedicated connection.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError>;
}

/// A connection over which advisory locks are held.
///
/// Locks are re-entrant within a session: acquiring a key the session already
/// holds succeeds and must be balanced by an extra `release`. Every lock held by
/// a session is freed when the session is closed or dropped.
#[async_trait]
pub trait LockSession: Send {
    /// Non-blocking attempt. `Ok(false)` means another session holds `key`.
    async fn try_acquire(&mut self, key: i64, timeout: Duration) -> Result<bool, LockError>;

    /// Releases one grant of `key`. `Ok(false)` means the session did not hold it.
    async fn release(&mut self, key: i64) -> Result<bool, LockError>;

    /// Closes the underlying connection.
    async fn close(self: Box<Self>);
}
