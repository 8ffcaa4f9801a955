//! Query execution tools.
//!
//! This module implements the `execute_query` and `sample_data` MCP tools.
//! Statements are validated against the backend's read-only policy before
//! any connection is used.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{BackendRegistry, QueryExecutor};
use crate::error::DbResult;
use crate::models::{
    ColumnInfo, MAX_SAMPLE_LIMIT, QueryParam, QueryRequest, QueryResult, ScalarValue,
};
use crate::tools::format::{OutputFormat, format_as_markdown, format_as_table};
use crate::tools::require_backend;

/// Input for the execute_query tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QueryInput {
    /// Backend name from list_databases
    pub backend: String,
    /// SQL statement. Read-only backends accept a single SELECT (or WITH) only.
    pub sql: String,
    /// Positional parameters (use ?, $1,$2... or %s placeholders in SQL)
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Maximum rows to return. Default: 100, max: 1000
    #[serde(default)]
    pub row_limit: Option<u32>,
    /// Output format: "json" returns structured data, "table" returns ASCII table, "markdown" returns markdown table
    #[serde(default)]
    pub format: OutputFormat,
}

/// Input for the sample_data tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SampleDataInput {
    /// Backend name from list_databases
    pub backend: String,
    pub table: String,
    /// Schema containing the table. Defaults to the backend's default schema.
    #[serde(default)]
    pub schema: Option<String>,
    /// Rows to return. Default: 10, max: 100
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Output from the query tools.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QueryOutput {
    /// Column names and declared types. Omitted if format is table/markdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnInfo>>,
    /// Rows as positional value arrays. Omitted if format is table/markdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<ScalarValue>>>,
    /// Pre-formatted output when format is table or markdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    pub row_count: usize,
    /// True if more rows existed than row_limit
    pub truncated: bool,
    pub row_limit: u32,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl QueryOutput {
    pub fn from_result(result: QueryResult, format: OutputFormat, warning: Option<String>) -> Self {
        let formatted = match format {
            OutputFormat::Json => None,
            OutputFormat::Table => Some(format_as_table(&result)),
            OutputFormat::Markdown => Some(format_as_markdown(&result)),
        };
        let (columns, rows) = if formatted.is_some() {
            (None, None)
        } else {
            (Some(result.columns), Some(result.rows))
        };
        Self {
            columns,
            rows,
            formatted,
            row_count: result.row_count,
            truncated: result.truncated,
            row_limit: result.row_limit,
            execution_time_ms: result.execution_time_ms,
            warning,
        }
    }
}

fn limit_warning(requested: Option<u32>, max: u32) -> Option<String> {
    requested.filter(|&n| n > max).map(|n| {
        format!("Requested limit {n} exceeds maximum allowed ({max}). Results capped to {max} rows.")
    })
}

/// Handler for query execution.
pub struct QueryToolHandler {
    registry: Arc<BackendRegistry>,
    executor: QueryExecutor,
}

impl QueryToolHandler {
    pub fn new(registry: Arc<BackendRegistry>, executor: QueryExecutor) -> Self {
        Self { registry, executor }
    }

    pub async fn execute_query(&self, input: QueryInput) -> DbResult<QueryOutput> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let warning = limit_warning(input.row_limit, self.executor.validator().policy().max_row_limit);

        let request = QueryRequest {
            backend: name.to_string(),
            sql: input.sql,
            params: input.params,
            row_limit: input.row_limit,
        };
        let result = self.executor.execute(backend.as_ref(), &request).await?;

        info!(
            backend = %name,
            row_count = result.row_count,
            truncated = result.truncated,
            execution_time_ms = result.execution_time_ms,
            "Query executed"
        );
        Ok(QueryOutput::from_result(result, input.format, warning))
    }

    pub async fn sample_data(&self, input: SampleDataInput) -> DbResult<QueryOutput> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let warning = limit_warning(input.limit, MAX_SAMPLE_LIMIT);

        let result = self
            .executor
            .sample(backend.as_ref(), &input.table, input.schema.as_deref(), input.limit)
            .await?;

        info!(
            backend = %name,
            table = %input.table,
            row_count = result.row_count,
            "Sampled table"
        );
        Ok(QueryOutput::from_result(result, input.format, warning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_input_deserialization() {
        let json = r#"{
            "backend": "local",
            "sql": "SELECT * FROM users WHERE id = $1",
            "params": [42, "x", null],
            "row_limit": 5
        }"#;

        let input: QueryInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.backend, "local");
        assert_eq!(
            input.params,
            vec![QueryParam::Int(42), QueryParam::from("x"), QueryParam::Null]
        );
        assert_eq!(input.row_limit, Some(5));
        assert_eq!(input.format, OutputFormat::Json);
    }

    #[test]
    fn test_limit_warning() {
        assert!(limit_warning(Some(5000), 1000).unwrap().contains("capped to 1000"));
        assert!(limit_warning(Some(10), 1000).is_none());
        assert!(limit_warning(None, 1000).is_none());
    }

    #[test]
    fn test_formatted_output_omits_rows() {
        let result = QueryResult {
            columns: vec![ColumnInfo::new("n", "INTEGER")],
            rows: vec![vec![ScalarValue::Int(1)]],
            row_count: 1,
            truncated: false,
            row_limit: 100,
            execution_time_ms: 1,
        };
        let output = QueryOutput::from_result(result.clone(), OutputFormat::Markdown, None);
        let json = serde_json::to_value(&output).unwrap();
        assert!(json.get("rows").is_none());
        assert!(json["formatted"].as_str().unwrap().contains("| n |"));

        let output = QueryOutput::from_result(result, OutputFormat::Json, None);
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["rows"][0][0], 1);
        assert_eq!(json["columns"][0]["declared_type"], "INTEGER");
    }
}
