//! Error types for the cache coordinator
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Lock Error Enum ==
/// Failures reported by an advisory-lock provider.
///
/// Contention is not an error: a lock held elsewhere is reported as `Ok(false)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock provider rejected the calling principal
    #[error("Permission denied by lock provider: {0}")]
    PermissionDenied(String),

    /// The connection holding (or opening) the session failed
    #[error("Lock connection error: {0}")]
    Connection(String),

    /// A lock round trip did not complete in time
    #[error("Lock operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other provider failure
    #[error("Lock provider error: {0}")]
    Backend(String),
}

impl LockError {
    /// Returns true for errors that require operator intervention.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, LockError::PermissionDenied(_))
    }

    /// Returns true for errors that may clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::Connection(_) | LockError::Timeout(_))
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            LockError::PermissionDenied(_) => "permission",
            LockError::Connection(_) => "connection",
            LockError::Timeout(_) => "timeout",
            LockError::Backend(_) => "backend",
        }
    }
}

// == Coordination Error Enum ==
/// Errors surfaced by leadership state and the leader elector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The leadership state was disposed; the caller used it after shutdown
    #[error("Leadership state has been disposed")]
    Disposed,

    /// The operation observed its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// The external lock failed
    #[error(transparent)]
    Lock(#[from] LockError),
}

// == Cache Error Enum ==
/// Unified error type for the cache coordinator.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Database failure on the data path
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Leadership coordination failure
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Coordination(CoordinationError::Disposed)
            | CacheError::Coordination(CoordinationError::Cancelled) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::Database(_) | CacheError::Config(_) | CacheError::Coordination(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache coordinator.
pub type Result<T> = std::result::Result<T, CacheError>;
