//! API Routes
//!
//! Configures the Axum router with the inspection endpoints.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{health_handler, leadership_handler, AppState};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check endpoint
/// - `GET /leadership` - Leadership snapshot
///
/// # Middleware
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/leadership", get(leadership_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
