//! Schema introspection tools.
//!
//! This module implements `list_databases`, `test_connection`, `list_schemas`,
//! `list_tables` and `describe_table`.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{BackendRegistry, SchemaInspector};
use crate::error::DbResult;
use crate::models::{BackendSummary, ConnectionStatus, SchemaList, TableList, TableSchema};
use crate::tools::format::{
    OutputFormat, format_backends, format_schema_list, format_table_list, format_table_schema,
};
use crate::tools::require_backend;

/// Input for tools that only name a backend.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BackendInput {
    /// Backend name from list_databases
    pub backend: String,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListDatabasesInput {
    /// "json" (default) or "markdown"
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListSchemasInput {
    /// Backend name from list_databases
    pub backend: String,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Input for the list_tables tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListTablesInput {
    /// Backend name from list_databases
    pub backend: String,
    /// Schema to list. Defaults to the backend's default schema.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Input for the describe_table tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DescribeTableInput {
    /// Backend name from list_databases
    pub backend: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListDatabasesOutput {
    pub backends: Vec<BackendSummary>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListSchemasOutput {
    #[serde(flatten)]
    pub list: SchemaList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListTablesOutput {
    #[serde(flatten)]
    pub list: TableList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct DescribeTableOutput {
    #[serde(flatten)]
    pub table: TableSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

/// Render with `render` unless JSON was asked for. Table output falls back to markdown.
fn formatted<T: ?Sized>(
    value: &T,
    format: OutputFormat,
    render: fn(&T) -> String,
) -> Option<String> {
    match format {
        OutputFormat::Json => None,
        OutputFormat::Table | OutputFormat::Markdown => Some(render(value)),
    }
}

/// Handler for schema introspection tools.
pub struct SchemaToolHandler {
    registry: Arc<BackendRegistry>,
}

impl SchemaToolHandler {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    pub fn list_databases(&self, input: ListDatabasesInput) -> ListDatabasesOutput {
        let backends = self.registry.summaries();
        let formatted = formatted(backends.as_slice(), input.format, format_backends);
        ListDatabasesOutput {
            count: backends.len(),
            backends,
            formatted,
        }
    }

    pub async fn test_connection(&self, input: BackendInput) -> DbResult<ConnectionStatus> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let status = SchemaInspector::test_connection(backend.as_ref()).await?;
        info!(backend = %name, connected = status.connected, "Tested connection");
        Ok(status)
    }

    pub async fn list_schemas(&self, input: ListSchemasInput) -> DbResult<ListSchemasOutput> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let list = SchemaInspector::list_schemas(backend.as_ref()).await?;
        info!(backend = %name, count = list.count, "Listed schemas");
        Ok(ListSchemasOutput {
            formatted: formatted(&list, input.format, format_schema_list),
            list,
        })
    }

    pub async fn list_tables(&self, input: ListTablesInput) -> DbResult<ListTablesOutput> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let list = SchemaInspector::list_tables(backend.as_ref(), input.schema.as_deref()).await?;
        info!(backend = %name, count = list.count, "Listed tables");
        Ok(ListTablesOutput {
            formatted: formatted(&list, input.format, format_table_list),
            list,
        })
    }

    pub async fn describe_table(&self, input: DescribeTableInput) -> DbResult<DescribeTableOutput> {
        let name = require_backend(&input.backend)?;
        let backend = self.registry.get(name)?;
        let table =
            SchemaInspector::describe_table(backend.as_ref(), &input.table, input.schema.as_deref())
                .await?;
        Ok(DescribeTableOutput {
            formatted: formatted(&table, input.format, format_table_schema),
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::ConnectionDescriptor;

    fn handler() -> SchemaToolHandler {
        let mut registry = BackendRegistry::new();
        registry
            .register(ConnectionDescriptor::sqlite("local", "/tmp/unused-schema-tool.db"))
            .unwrap();
        SchemaToolHandler::new(Arc::new(registry))
    }

    #[test]
    fn test_list_databases_markdown() {
        let output = handler().list_databases(ListDatabasesInput {
            format: OutputFormat::Markdown,
        });
        assert_eq!(output.count, 1);
        assert!(output.formatted.unwrap().contains("| local | SQLite | yes |"));
    }

    #[tokio::test]
    async fn test_blank_backend_rejected() {
        let err = handler()
            .list_tables(ListTablesInput {
                backend: "  ".into(),
                schema: None,
                format: OutputFormat::Json,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryValidationError);
        assert!(err.to_string().contains("list_databases"));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_not_found() {
        let err = handler()
            .test_connection(BackendInput {
                backend: "nope".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_describe_output_flattens_table() {
        let output = DescribeTableOutput {
            table: TableSchema::new("t"),
            formatted: None,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["table"], "t");
        assert!(json["columns"].as_array().unwrap().is_empty());
    }
}
