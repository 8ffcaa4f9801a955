//! End-to-end tests against a SQLite file through the tool handlers.
//!
//! A writable backend seeds the file; a read-only backend named `local`
//! points at the same file, the way a typical deployment pairs them.

use std::sync::Arc;

use multidb_mcp_server::db::BackendRegistry;
use multidb_mcp_server::db::QueryExecutor;
use multidb_mcp_server::models::{ConnectionDescriptor, QueryParam, ScalarValue};
use multidb_mcp_server::tools::format::OutputFormat;
use multidb_mcp_server::tools::query::{QueryInput, QueryToolHandler, SampleDataInput};
use multidb_mcp_server::tools::response::OperationResponse;
use multidb_mcp_server::tools::schema::{
    BackendInput, DescribeTableInput, ListSchemasInput, ListTablesInput, SchemaToolHandler,
};
use serde_json::Value;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    queries: QueryToolHandler,
    schemas: SchemaToolHandler,
}

fn query(backend: &str, sql: &str) -> QueryInput {
    QueryInput {
        backend: backend.to_string(),
        sql: sql.to_string(),
        params: vec![],
        row_limit: None,
        format: OutputFormat::Json,
    }
}

async fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.db");

    let mut registry = BackendRegistry::new();
    registry
        .register(ConnectionDescriptor::sqlite("admin", &path).with_read_only(false))
        .unwrap();
    registry
        .register(ConnectionDescriptor::sqlite("local", &path))
        .unwrap();
    let registry = Arc::new(registry);

    let queries = QueryToolHandler::new(Arc::clone(&registry), QueryExecutor::default());
    for sql in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT, score REAL DEFAULT 0)",
        "INSERT INTO users (name, email) VALUES ('alice', 'a@example.com'), ('bob', NULL), ('carol', 'c@example.com')",
    ] {
        queries.execute_query(query("admin", sql)).await.unwrap();
    }

    Fixture {
        _dir: dir,
        schemas: SchemaToolHandler::new(Arc::clone(&registry)),
        queries,
    }
}

fn to_json<T: serde::Serialize>(response: &OperationResponse<T>) -> Value {
    serde_json::to_value(response).unwrap()
}

#[tokio::test]
async fn test_row_limit_truncates() {
    let fx = setup().await;
    let mut input = query("local", "SELECT id, name FROM users ORDER BY id");
    input.row_limit = Some(2);

    let output = fx.queries.execute_query(input).await.unwrap();
    assert_eq!(output.row_count, 2);
    assert!(output.truncated);
    assert_eq!(output.row_limit, 2);

    let rows = output.rows.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], ScalarValue::Text("alice".into()));
    assert_eq!(rows[1][1], ScalarValue::Text("bob".into()));
}

#[tokio::test]
async fn test_exact_row_count_is_not_truncated() {
    let fx = setup().await;
    let mut input = query("local", "SELECT id FROM users");
    input.row_limit = Some(3);

    let output = fx.queries.execute_query(input).await.unwrap();
    assert_eq!(output.row_count, 3);
    assert!(!output.truncated);
}

#[tokio::test]
async fn test_delete_on_read_only_backend_is_rejected() {
    let fx = setup().await;
    let result = fx
        .queries
        .execute_query(query("local", "DELETE FROM users WHERE id = 1"))
        .await;
    let json = to_json(&OperationResponse::from_result("execute_query", result));

    assert_eq!(json["success"], false);
    assert_eq!(json["error_kind"], "query_validation_error");
    assert_eq!(json["keyword"], "DELETE");
    assert!(json.get("rows").is_none());

    let count = fx
        .queries
        .execute_query(query("local", "SELECT COUNT(*) FROM users"))
        .await
        .unwrap();
    assert_eq!(count.rows.unwrap()[0][0], ScalarValue::Int(3));
}

#[tokio::test]
async fn test_null_and_real_values_normalized() {
    let fx = setup().await;
    let output = fx
        .queries
        .execute_query(query("local", "SELECT email, score FROM users WHERE name = 'bob'"))
        .await
        .unwrap();
    let rows = output.rows.unwrap();
    assert_eq!(rows[0][0], ScalarValue::Null);
    assert_eq!(rows[0][1], ScalarValue::Float(0.0));

    let columns = output.columns.unwrap();
    assert_eq!(columns[0].name, "email");
    assert_eq!(columns[1].name, "score");
}

#[tokio::test]
async fn test_parameter_is_stored_literally() {
    let fx = setup().await;
    let payload = "x'); DROP TABLE users; --";

    let mut insert = query("admin", "INSERT INTO users (name) VALUES (?)");
    insert.params = vec![QueryParam::from(payload)];
    fx.queries.execute_query(insert).await.unwrap();

    let mut select = query("local", "SELECT name FROM users WHERE name = $1");
    select.params = vec![QueryParam::from(payload)];
    let output = fx.queries.execute_query(select).await.unwrap();
    assert_eq!(output.row_count, 1);
    assert_eq!(output.rows.unwrap()[0][0], ScalarValue::Text(payload.into()));

    let tables = fx
        .schemas
        .list_tables(ListTablesInput {
            backend: "local".into(),
            schema: None,
            format: OutputFormat::Json,
        })
        .await
        .unwrap();
    assert_eq!(tables.list.tables, vec!["users"]);
}

#[tokio::test]
async fn test_placeholder_count_mismatch() {
    let fx = setup().await;
    let mut input = query("local", "SELECT * FROM users WHERE id = ? AND name = ?");
    input.params = vec![QueryParam::Int(1)];

    let result = fx.queries.execute_query(input).await;
    let json = to_json(&OperationResponse::from_result("execute_query", result));
    assert_eq!(json["error_kind"], "query_validation_error");
}

#[tokio::test]
async fn test_execution_error_kind() {
    let fx = setup().await;
    let result = fx
        .queries
        .execute_query(query("local", "SELECT missing_column FROM users"))
        .await;
    let json = to_json(&OperationResponse::from_result("execute_query", result));
    assert_eq!(json["success"], false);
    assert_eq!(json["error_kind"], "query_execution_error");
}

#[tokio::test]
async fn test_describe_table_in_definition_order() {
    let fx = setup().await;
    let output = fx
        .schemas
        .describe_table(DescribeTableInput {
            backend: "local".into(),
            table: "users".into(),
            schema: None,
            format: OutputFormat::Json,
        })
        .await
        .unwrap();

    let names: Vec<_> = output.table.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "name", "email", "score"]);
    assert_eq!(output.table.primary_key(), vec!["id"]);

    let name = &output.table.columns[1];
    assert!(!name.nullable);
    let positions: Vec<_> = output
        .table
        .columns
        .iter()
        .map(|c| c.ordinal_position)
        .collect();
    assert_eq!(positions, [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_describe_table_markdown() {
    let fx = setup().await;
    let output = fx
        .schemas
        .describe_table(DescribeTableInput {
            backend: "local".into(),
            table: "users".into(),
            schema: None,
            format: OutputFormat::Markdown,
        })
        .await
        .unwrap();
    let text = output.formatted.unwrap();
    assert!(text.contains("| Column | Type | Nullable | Primary Key | Default |"));
    assert!(text.contains("| id |"));
}

#[tokio::test]
async fn test_describe_missing_table_is_not_found() {
    let fx = setup().await;
    let result = fx
        .schemas
        .describe_table(DescribeTableInput {
            backend: "local".into(),
            table: "nope".into(),
            schema: None,
            format: OutputFormat::Json,
        })
        .await;
    let json = to_json(&OperationResponse::from_result("describe_table", result));
    assert_eq!(json["error_kind"], "not_found");
}

#[tokio::test]
async fn test_list_schemas_unsupported() {
    let fx = setup().await;
    let result = fx
        .schemas
        .list_schemas(ListSchemasInput {
            backend: "local".into(),
            format: OutputFormat::Json,
        })
        .await;
    let json = to_json(&OperationResponse::from_result("list_schemas", result));
    assert_eq!(json["success"], false);
    assert_eq!(json["error_kind"], "unsupported_operation");
}

#[tokio::test]
async fn test_connection_reports_version() {
    let fx = setup().await;
    let status = fx
        .schemas
        .test_connection(BackendInput {
            backend: "local".into(),
        })
        .await
        .unwrap();
    assert!(status.connected);
    assert!(status.read_only);
    assert!(status.version.unwrap().starts_with("SQLite 3"));
}

#[tokio::test]
async fn test_sample_data_default_and_format() {
    let fx = setup().await;
    let output = fx
        .queries
        .sample_data(SampleDataInput {
            backend: "local".into(),
            table: "users".into(),
            schema: None,
            limit: None,
            format: OutputFormat::Table,
        })
        .await
        .unwrap();
    assert_eq!(output.row_count, 3);
    assert!(!output.truncated);
    assert!(output.rows.is_none());
    let table = output.formatted.unwrap();
    assert!(table.contains("alice"));
    assert!(table.contains("+-"));
}

#[tokio::test]
async fn test_sample_data_limit_over_maximum_warns() {
    let fx = setup().await;
    let output = fx
        .queries
        .sample_data(SampleDataInput {
            backend: "local".into(),
            table: "users".into(),
            schema: None,
            limit: Some(5000),
            format: OutputFormat::Json,
        })
        .await
        .unwrap();
    assert_eq!(output.row_limit, 100);
    assert!(output.warning.is_some());
}

#[tokio::test]
async fn test_sample_data_other_schema_unsupported() {
    let fx = setup().await;
    let describe = fx
        .schemas
        .describe_table(DescribeTableInput {
            backend: "local".into(),
            table: "users".into(),
            schema: Some("archive".into()),
            format: OutputFormat::Json,
        })
        .await;
    let sample = fx
        .queries
        .sample_data(SampleDataInput {
            backend: "local".into(),
            table: "users".into(),
            schema: Some("archive".into()),
            limit: None,
            format: OutputFormat::Json,
        })
        .await;

    let describe = to_json(&OperationResponse::from_result("describe_table", describe));
    let sample = to_json(&OperationResponse::from_result("sample_data", sample));
    assert_eq!(describe["error_kind"], "unsupported_operation");
    assert_eq!(sample["error_kind"], "unsupported_operation");
    assert!(sample["message"].as_str().unwrap().contains("local"));

    let main = fx
        .queries
        .sample_data(SampleDataInput {
            backend: "local".into(),
            table: "users".into(),
            schema: Some("main".into()),
            limit: None,
            format: OutputFormat::Json,
        })
        .await
        .unwrap();
    assert_eq!(main.row_count, 3);
}

#[tokio::test]
async fn test_utf8_round_trip() {
    let fx = setup().await;
    let text = "Zürich 東京 🚀";

    let mut insert = query("admin", "INSERT INTO users (name) VALUES (?)");
    insert.params = vec![QueryParam::from(text)];
    fx.queries.execute_query(insert).await.unwrap();

    let mut select = query("local", "SELECT name FROM users WHERE name = ?");
    select.params = vec![QueryParam::from(text)];
    let output = fx.queries.execute_query(select).await.unwrap();
    assert_eq!(output.rows.unwrap()[0][0], ScalarValue::Text(text.into()));
}
