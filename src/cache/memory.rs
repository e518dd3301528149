//! In-Memory Cache Store
//!
//! Expiring entries held in process, with the same bounded expired-item
//! removal as the Postgres table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ExpiredItemRemover;
use crate::error::Result;

// == Cache Entry ==
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    /// None = no expiration
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Expired once `now` reaches the expiration instant.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

// == Memory Cache Store ==
/// Shared expiring key/value map. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` under `key`, overwriting any previous entry.
    pub fn insert(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.entries().insert(
            key.into(),
            CacheEntry {
                value: value.into(),
                expires_at,
            },
        );
    }

    /// Returns the value if present and not expired at `now`.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        self.entries()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[async_trait]
impl ExpiredItemRemover for MemoryCacheStore {
    async fn delete_expired(&self, now: DateTime<Utc>, max_batch: u32) -> Result<u64> {
        let mut entries = self.entries();

        let mut expired: Vec<(DateTime<Utc>, String)> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .filter_map(|(key, entry)| entry.expires_at.map(|at| (at, key.clone())))
            .collect();

        // oldest expirations go first, matching the SQL ORDER BY
        expired.sort();
        expired.truncate(max_batch as usize);

        for (_, key) in &expired {
            entries.remove(key);
        }
        Ok(expired.len() as u64)
    }
}
