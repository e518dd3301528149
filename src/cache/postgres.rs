//! Postgres Expired Item Remover
//!
//! Deletes expired rows from the cache table in bounded batches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::ExpiredItemRemover;
use crate::config::is_valid_identifier;
use crate::error::{CacheError, Result};

/// Batch delete against `"schema"."table"` with an `id` key and an
/// `expires_at_time` timestamp column.
#[derive(Debug, Clone)]
pub struct PgExpiredItemRemover {
    pool: PgPool,
    delete_sql: String,
}

impl PgExpiredItemRemover {
    pub fn new(pool: PgPool, schema: &str, table: &str) -> Result<Self> {
        if !is_valid_identifier(schema) || !is_valid_identifier(table) {
            return Err(CacheError::Config(format!(
                "'{}.{}' is not a valid table identifier",
                schema, table
            )));
        }

        Ok(Self {
            pool,
            delete_sql: delete_expired_sql(schema, table),
        })
    }
}

#[async_trait]
impl ExpiredItemRemover for PgExpiredItemRemover {
    async fn delete_expired(&self, now: DateTime<Utc>, max_batch: u32) -> Result<u64> {
        let result = sqlx::query(&self.delete_sql)
            .bind(now)
            .bind(i64::from(max_batch))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn delete_expired_sql(schema: &str, table: &str) -> String {
    format!(
        r#"DELETE FROM "{schema}"."{table}"
WHERE id IN (
    SELECT id FROM "{schema}"."{table}"
    WHERE expires_at_time <= $1
    ORDER BY expires_at_time
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)"#
    )
}
