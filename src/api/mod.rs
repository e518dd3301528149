//! API Module
//!
//! HTTP handlers and routing for the read-only inspection API.
//!
//! # Endpoints
//! - `GET /health` - Health check with the current maintenance role
//! - `GET /leadership` - Leadership snapshot of this instance

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
