//! Postgres Advisory Lock
//!
//! Session-level advisory locks held over a dedicated connection. Postgres
//! releases them on its own if the connection goes away.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use super::{LockProvider, LockSession};
use crate::error::LockError;

// == SQLSTATE codes ==
const INSUFFICIENT_PRIVILEGE: &str = "42501";
const INVALID_AUTHORIZATION: &str = "28000";
const INVALID_PASSWORD: &str = "28P01";
/// Class 08: connection exception
const CONNECTION_EXCEPTION_CLASS: &str = "08";
/// Class 57P: operator intervention (admin shutdown, crash shutdown, cannot connect now)
const OPERATOR_INTERVENTION_CLASS: &str = "57P";

/// Opens one dedicated Postgres connection per lock session.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLock {
    options: PgConnectOptions,
    timeout: Duration,
}

impl PgAdvisoryLock {
    /// `timeout` bounds connecting, releasing and closing.
    pub fn new(options: PgConnectOptions, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    pub fn from_url(url: &str, timeout: Duration) -> Result<Self, LockError> {
        let options = url
            .parse::<PgConnectOptions>()
            .map_err(|e| LockError::Backend(format!("invalid database url: {}", e)))?;
        Ok(Self::new(options, timeout))
    }
}

#[async_trait]
impl LockProvider for PgAdvisoryLock {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        let conn = tokio::time::timeout(self.timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| LockError::Timeout(self.timeout))?
            .map_err(classify_sqlx_error)?;

        Ok(Box::new(PgLockSession {
            conn,
            timeout: self.timeout,
        }))
    }
}

struct PgLockSession {
    conn: PgConnection,
    timeout: Duration,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_acquire(&mut self, key: i64, timeout: Duration) -> Result<bool, LockError> {
        let query = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn);

        tokio::time::timeout(timeout, query)
            .await
            .map_err(|_| LockError::Timeout(timeout))?
            .map_err(classify_sqlx_error)
    }

    async fn release(&mut self, key: i64) -> Result<bool, LockError> {
        let query = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn);

        tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| LockError::Timeout(self.timeout))?
            .map_err(classify_sqlx_error)
    }

    async fn close(self: Box<Self>) {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Lock connection closed with error"),
            Err(_) => debug!(?timeout, "Lock connection close timed out"),
        }
    }
}

// == Error Classification ==
/// Maps a sqlx failure onto the lock error taxonomy.
pub fn classify_sqlx_error(err: sqlx::Error) -> LockError {
    match &err {
        sqlx::Error::Database(db_err) => classify_sqlstate(db_err.code().as_deref(), db_err.message()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LockError::Connection(err.to_string()),
        _ => LockError::Backend(err.to_string()),
    }
}

fn classify_sqlstate(code: Option<&str>, message: &str) -> LockError {
    match code {
        Some(INSUFFICIENT_PRIVILEGE | INVALID_AUTHORIZATION | INVALID_PASSWORD) => {
            LockError::PermissionDenied(message.to_string())
        }
        Some(code)
            if code.starts_with(CONNECTION_EXCEPTION_CLASS)
                || code.starts_with(OPERATOR_INTERVENTION_CLASS) =>
        {
            LockError::Connection(message.to_string())
        }
        Some(code) => LockError::Backend(format!("{} (SQLSTATE {})", message, code)),
        None => LockError::Backend(message.to_string()),
    }
}
