//! Configuration Module
//!
//! Handles loading and managing coordinator configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::leadership::lock_key;

/// Leader election tuning, consumed by [`crate::leadership::LeaderElector`].
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Timeout for a single lock round trip
    pub acquire_timeout: Duration,
    /// Verification cadence while leading
    pub heartbeat_interval: Duration,
    /// Continuous tenure after which the leader steps down
    pub voluntary_yield_interval: Duration,
    /// Pause after a voluntary yield before competing again
    pub yield_window: Duration,
    /// Base delay of the exponential backoff
    pub backoff_base: Duration,
    /// Upper bound of the exponential backoff
    pub backoff_max: Duration,
    /// Symmetric jitter bound added to every backoff delay
    pub backoff_jitter: Duration,
    /// Fixed delay after an unexpected error in the election loop
    pub error_retry_delay: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            voluntary_yield_interval: Duration::from_secs(300),
            yield_window: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: Duration::from_millis(250),
            error_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Expired-item maintenance cadence.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance ticks
    pub interval: Duration,
    /// Upper bound on rows deleted per tick
    pub batch_size: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 1000,
        }
    }
}

/// Coordinator configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port of the inspection API
    pub server_port: u16,
    /// Postgres connection URL
    pub database_url: Option<String>,
    /// Schema holding the cache table
    pub schema_name: String,
    /// Cache table name
    pub table_name: String,
    /// Stable identity of this process
    pub instance_id: String,
    /// When false, every instance runs maintenance and no election takes place
    pub coordination_enabled: bool,
    pub election: ElectionConfig,
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - Inspection API port (default: 3000)
    /// - `DATABASE_URL` - Postgres URL (no default)
    /// - `CACHE_SCHEMA` / `CACHE_TABLE` - Cache table location (default: public.cache_items)
    /// - `INSTANCE_ID` - Instance identity (default: `<HOSTNAME>-<pid>`)
    /// - `COORDINATION_ENABLED` - Elect a single maintenance manager (default: true)
    /// - `LOCK_ACQUIRE_TIMEOUT_MS` - Lock round trip timeout (default: 5000)
    /// - `CLEANUP_INTERVAL` - Maintenance frequency in seconds (default: 300)
    /// - `CLEANUP_BATCH_SIZE` - Rows deleted per tick at most (default: 1000)
    /// - `LEADER_YIELD_INTERVAL` - Voluntary yield tenure in seconds (default: 300)
    /// - `LEADER_YIELD_WINDOW_MS` - Pause after yielding (default: 2000)
    /// - `LEADER_HEARTBEAT_MS` - Lock verification cadence (default: 10000)
    /// - `BACKOFF_BASE_MS` / `BACKOFF_MAX_MS` / `BACKOFF_JITTER_MS` (default: 1000 / 30000 / 250)
    /// - `ERROR_RETRY_DELAY_MS` - Delay after an unexpected loop error (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let election = ElectionConfig {
            acquire_timeout: env_millis("LOCK_ACQUIRE_TIMEOUT_MS", defaults.election.acquire_timeout),
            heartbeat_interval: env_millis("LEADER_HEARTBEAT_MS", defaults.election.heartbeat_interval),
            voluntary_yield_interval: Duration::from_secs(env_or(
                "LEADER_YIELD_INTERVAL",
                defaults.election.voluntary_yield_interval.as_secs(),
            )),
            yield_window: env_millis("LEADER_YIELD_WINDOW_MS", defaults.election.yield_window),
            backoff_base: env_millis("BACKOFF_BASE_MS", defaults.election.backoff_base),
            backoff_max: env_millis("BACKOFF_MAX_MS", defaults.election.backoff_max),
            backoff_jitter: env_millis("BACKOFF_JITTER_MS", defaults.election.backoff_jitter),
            error_retry_delay: env_millis("ERROR_RETRY_DELAY_MS", defaults.election.error_retry_delay),
        };
        let maintenance = MaintenanceConfig {
            interval: Duration::from_secs(env_or(
                "CLEANUP_INTERVAL",
                defaults.maintenance.interval.as_secs(),
            )),
            batch_size: env_or("CLEANUP_BATCH_SIZE", defaults.maintenance.batch_size),
        };

        Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            schema_name: env::var("CACHE_SCHEMA").unwrap_or(defaults.schema_name),
            table_name: env::var("CACHE_TABLE").unwrap_or(defaults.table_name),
            instance_id: env::var("INSTANCE_ID").unwrap_or(defaults.instance_id),
            coordination_enabled: env_or("COORDINATION_ENABLED", defaults.coordination_enabled),
            election,
            maintenance,
        }
    }

    /// Checks the values that would otherwise fail deep inside a background loop.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(CacheError::Config("instance id cannot be empty".to_string()));
        }
        for (label, ident) in [("schema", &self.schema_name), ("table", &self.table_name)] {
            if !is_valid_identifier(ident) {
                return Err(CacheError::Config(format!(
                    "{} name '{}' is not a valid SQL identifier",
                    label, ident
                )));
            }
        }
        if self.maintenance.batch_size == 0 {
            return Err(CacheError::Config("batch size must be positive".to_string()));
        }
        if self.maintenance.interval.is_zero() {
            return Err(CacheError::Config("cleanup interval must be positive".to_string()));
        }
        if self.election.heartbeat_interval.is_zero() {
            return Err(CacheError::Config("heartbeat interval must be positive".to_string()));
        }
        if self.election.acquire_timeout.is_zero() {
            return Err(CacheError::Config("lock acquire timeout must be positive".to_string()));
        }
        if self.election.backoff_base > self.election.backoff_max {
            return Err(CacheError::Config(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.election.backoff_base, self.election.backoff_max
            )));
        }
        Ok(())
    }

    /// Advisory lock key shared by every instance serving the same cache table.
    pub fn lock_key(&self) -> i64 {
        lock_key(&self.schema_name, &self.table_name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            database_url: None,
            schema_name: "public".to_string(),
            table_name: "cache_items".to_string(),
            instance_id: default_instance_id(),
            coordination_enabled: true,
            election: ElectionConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(name, default.as_millis() as u64))
}

fn default_instance_id() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "pgcache".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Accepts plain unquoted identifiers only, so they can be embedded in SQL safely.
pub(crate) fn is_valid_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    ident.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
