//! Cache Module
//!
//! The expired-item removal boundary driven by the maintenance scheduler.
//!
//! # Implementations
//! - [`PgExpiredItemRemover`]: bounded `DELETE` on the Postgres cache table
//! - [`MemoryCacheStore`]: in-process expiring entries

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryCacheStore;
pub use postgres::PgExpiredItemRemover;

/// Deletes entries that expired at or before `now`, at most `max_batch` per call.
///
/// Must be idempotent and safe to call with overlapping windows from several
/// instances at once.
#[async_trait]
pub trait ExpiredItemRemover: Send + Sync {
    /// Returns the number of entries removed.
    async fn delete_expired(&self, now: DateTime<Utc>, max_batch: u32) -> Result<u64>;
}
