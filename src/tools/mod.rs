//! MCP tool implementations.
//!
//! - `query`: `execute_query` and `sample_data`
//! - `schema`: `list_databases`, `test_connection`, `list_schemas`, `list_tables`, `describe_table`
//! - `sql_validator`: query safety validation and placeholder rewriting
//! - `format`: ASCII table and markdown renderings
//! - `response`: the `{success, ...}` envelope every tool returns

pub mod format;
pub mod query;
pub mod response;
pub mod schema;
pub mod sql_validator;

pub use format::OutputFormat;
pub use query::{QueryInput, QueryOutput, QueryToolHandler, SampleDataInput};
pub use response::{ErrorPayload, OperationResponse};
pub use schema::{
    BackendInput, DescribeTableInput, DescribeTableOutput, ListDatabasesInput,
    ListDatabasesOutput, ListSchemasInput, ListSchemasOutput, ListTablesInput, ListTablesOutput,
    SchemaToolHandler,
};
pub use sql_validator::{QueryPolicy, QueryValidator, StatementKind, ValidatedQuery};

use crate::error::{DbError, DbResult};

/// Trimmed backend name, or an error pointing the caller at `list_databases`.
pub(crate) fn require_backend(provided: &str) -> DbResult<&str> {
    let trimmed = provided.trim();
    if trimmed.is_empty() {
        Err(DbError::validation(
            "backend is required. Call list_databases first to get available backend names.",
        ))
    } else {
        Ok(trimmed)
    }
}
