//! Query execution engine.
//!
//! Validation happens here, before a connection is acquired. The validated
//! statement then runs on a pooled handle and the driver rows are normalized
//! into a [`QueryResult`] bounded by the effective row limit.

use std::time::Instant;

use tracing::{debug, info};

use crate::db::adapter::Operation;
use crate::db::normalize::normalize;
use crate::db::registry::Backend;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_SAMPLE_LIMIT, MAX_SAMPLE_LIMIT, QueryRequest, QueryResult};
use crate::tools::sql_validator::{QueryPolicy, QueryTarget, QueryValidator};

/// Query executor that validates, runs and normalizes queries.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    validator: QueryValidator,
}

impl QueryExecutor {
    pub fn new(policy: QueryPolicy) -> Self {
        Self {
            validator: QueryValidator::new(policy),
        }
    }

    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    /// Execute a caller-supplied query against `backend`.
    pub async fn execute(&self, backend: &dyn Backend, request: &QueryRequest) -> DbResult<QueryResult> {
        let descriptor = backend.descriptor();
        let target = QueryTarget {
            backend_type: descriptor.backend_type,
            read_only: descriptor.read_only,
            placeholder_style: backend.placeholder_style(),
        };
        let validated =
            self.validator
                .validate(target, &request.sql, &request.params, request.row_limit)?;

        debug!(
            backend = %backend.name(),
            sql = %validated.sql,
            params = validated.params.len(),
            row_limit = validated.row_limit,
            "Executing query"
        );

        let started = Instant::now();
        let fetch_limit = validated.fetch_limit();
        let row_limit = validated.row_limit;
        let raw = backend
            .run(Operation::Execute {
                sql: validated.sql,
                params: validated.params,
                fetch_limit,
            })
            .await?
            .into_rows()?;

        let result = normalize(raw, row_limit, started.elapsed());
        info!(
            backend = %backend.name(),
            row_count = result.row_count,
            truncated = result.truncated,
            elapsed_ms = result.execution_time_ms,
            "Query completed"
        );
        Ok(result)
    }

    /// Return up to `limit` rows of `table` (default 10, max 100).
    ///
    /// The statement is built by the backend's dialect with quoted identifiers,
    /// so it bypasses caller-text validation.
    pub async fn sample(
        &self,
        backend: &dyn Backend,
        table: &str,
        schema: Option<&str>,
        limit: Option<u32>,
    ) -> DbResult<QueryResult> {
        if table.trim().is_empty() {
            return Err(DbError::validation("Table name is empty"));
        }
        let limit = sample_limit(limit)?;
        let sql = backend.sample_query(table, schema, limit)?;
        debug!(backend = %backend.name(), %sql, "Sampling table");

        let started = Instant::now();
        let raw = backend
            .run(Operation::Execute {
                sql,
                params: Vec::new(),
                fetch_limit: limit as usize + 1,
            })
            .await?
            .into_rows()?;
        Ok(normalize(raw, limit, started.elapsed()))
    }
}

fn sample_limit(requested: Option<u32>) -> DbResult<u32> {
    match requested {
        None => Ok(DEFAULT_SAMPLE_LIMIT),
        Some(0) => Err(DbError::validation("limit must be at least 1")),
        Some(n) => Ok(n.min(MAX_SAMPLE_LIMIT)),
    }
}
