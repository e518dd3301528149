//! API Handlers
//!
//! HTTP request handlers for each inspection endpoint. Handlers read the
//! leadership state only; they never touch the advisory lock.

use std::sync::Arc;

use axum::{extract::State, Json};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::leadership::{LeadershipSnapshot, LeadershipState};
use crate::models::{HealthResponse, LeadershipResponse, Role};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Leadership record of this instance
    pub leadership: Arc<LeadershipState>,
    /// Whether maintenance is gated on leadership
    pub coordination_enabled: bool,
}

impl AppState {
    /// Creates a new AppState over the given leadership state.
    pub fn new(leadership: Arc<LeadershipState>, coordination_enabled: bool) -> Self {
        Self {
            leadership,
            coordination_enabled,
        }
    }

    async fn snapshot(&self) -> Result<LeadershipSnapshot> {
        // request handlers are not cancelled by shutdown; disposal still fails them
        Ok(self.leadership.snapshot(&CancellationToken::new()).await?)
    }
}

/// Handler for GET /health
///
/// Returns health status and the maintenance role of this instance.
pub async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let snapshot = state.snapshot().await?;
    let role = Role::from_snapshot(state.coordination_enabled, &snapshot);

    Ok(Json(HealthResponse::healthy(
        state.leadership.instance_id(),
        role,
    )))
}

/// Handler for GET /leadership
///
/// Returns the leadership snapshot without touching the lock.
pub async fn leadership_handler(
    State(state): State<AppState>,
) -> Result<Json<LeadershipResponse>> {
    let snapshot = state.snapshot().await?;

    Ok(Json(LeadershipResponse::new(
        state.leadership.instance_id(),
        state.coordination_enabled,
        snapshot,
    )))
}
