//! Response DTOs for the inspection API
//!
//! Defines the structure of outgoing HTTP response bodies.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::leadership::LeadershipSnapshot;

/// Maintenance role reported by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the advisory lock and runs maintenance
    Leader,
    /// Competing for the lock
    Follower,
    /// Coordination disabled; runs maintenance unconditionally
    Uncoordinated,
}

impl Role {
    pub fn from_snapshot(coordination_enabled: bool, snapshot: &LeadershipSnapshot) -> Self {
        match (coordination_enabled, snapshot.is_leader) {
            (false, _) => Role::Uncoordinated,
            (true, true) => Role::Leader,
            (true, false) => Role::Follower,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
    pub instance_id: String,
    pub role: Role,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(instance_id: impl Into<String>, role: Role) -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            instance_id: instance_id.into(),
            role,
        }
    }
}

/// Response body for the leadership endpoint (GET /leadership)
#[derive(Debug, Clone, Serialize)]
pub struct LeadershipResponse {
    pub instance_id: String,
    pub coordination_enabled: bool,
    pub is_leader: bool,
    pub elected_at: Option<DateTime<Utc>>,
    pub lost_at: Option<DateTime<Utc>>,
}

impl LeadershipResponse {
    pub fn new(
        instance_id: impl Into<String>,
        coordination_enabled: bool,
        snapshot: LeadershipSnapshot,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            coordination_enabled,
            is_leader: snapshot.is_leader,
            elected_at: snapshot.elected_at,
            lost_at: snapshot.lost_at,
        }
    }
}
