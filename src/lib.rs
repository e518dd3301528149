//! pgcache - Coordinated maintenance for a PostgreSQL-backed distributed cache
//!
//! Instances sharing one cache table elect a single maintenance manager via a
//! Postgres advisory lock; only the manager deletes expired rows.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod leadership;
pub mod lock;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use leadership::{spawn_leader_elector, LeaderElector, LeadershipState};
pub use tasks::spawn_maintenance_task;
