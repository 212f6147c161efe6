//! Statement execution.
//!
//! Statements arrive fully rendered with every value escaped inline, so they
//! run as raw text through `sqlx::Executor` (no server-side prepare). Each call
//! is instrumented with the pool's span.

use crate::db::pool::Pool;
use crate::db::types::{Row, RowToJson};
use crate::error::{DbError, DbResult};
use futures_util::TryStreamExt;
use sqlx::Executor;
use std::time::Instant;
use tracing::{Instrument, debug, error};

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Generated AUTO_INCREMENT id of the first inserted row, 0 when none.
    pub last_insert_id: u64,
}

/// Runs rendered statements on one pool.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor<'a> {
    pool: &'a Pool,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    /// Run a row-returning statement and decode every row.
    pub async fn fetch_rows(&self, sql: &str) -> DbResult<Vec<Row>> {
        let start = Instant::now();
        debug!(sql = %sql, "Executing query");

        let rows = async {
            self.pool
                .inner()
                .fetch(sql)
                .map_ok(|row| row.to_json_map())
                .try_collect::<Vec<_>>()
                .await
        }
        .instrument(self.pool.span().clone())
        .await
        .map_err(|e| self.failed(sql, e))?;

        debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query finished"
        );
        Ok(rows)
    }

    /// Run a write statement (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, sql: &str) -> DbResult<ExecOutcome> {
        let start = Instant::now();
        debug!(sql = %sql, "Executing write operation");

        let result = self
            .pool
            .inner()
            .execute(sql)
            .instrument(self.pool.span().clone())
            .await
            .map_err(|e| self.failed(sql, e))?;

        let outcome = ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        };
        debug!(
            rows_affected = outcome.rows_affected,
            last_insert_id = outcome.last_insert_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Write finished"
        );
        Ok(outcome)
    }

    fn failed(&self, sql: &str, e: sqlx::Error) -> DbError {
        error!(
            parent: self.pool.span(),
            sql = %sql,
            error = %e,
            "Statement failed"
        );
        DbError::from(e)
    }
}
