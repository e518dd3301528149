//! Background Tasks Module
//!
//! Contains background tasks that run periodically during coordinator operation.
//!
//! # Tasks
//! - Expired-item maintenance: deletes expired cache rows, on the elected manager only

mod maintenance;

pub use maintenance::{spawn_maintenance_task, MaintenanceGate, MaintenanceScheduler, TickOutcome};
