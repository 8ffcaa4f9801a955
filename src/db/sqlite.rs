//! SQLite adapter over `sqlx::SqliteConnection`.
//!
//! SQLite has no schemas beyond the attached `main` database, and a file
//! accepts one writer at a time, so the pool above this adapter always has
//! capacity one.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Executor, Row, Sqlite, Statement};
use tracing::{debug, warn};

use crate::db::adapter::{DialectAdapter, PlaceholderStyle, open_failed, quote_identifier};
use crate::db::normalize::RawResultSet;
use crate::db::types::{RowDecode, column_infos, normalize_type_name};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendType, ColumnDefinition, ConnectionDescriptor, ConnectionTarget, QueryParam, TableSchema,
};

mod queries {
    pub const LIST_TABLES: &str = r#"
        SELECT name FROM sqlite_master
        WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#;

    pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT cid, name, type, "notnull", dflt_value, pk
        FROM pragma_table_info(?1)
        ORDER BY cid
        "#;
}

const MAIN_SCHEMA: &str = "main";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn connect_options(descriptor: &ConnectionDescriptor) -> DbResult<SqliteConnectOptions> {
        let options = match &descriptor.target {
            ConnectionTarget::File { path } => SqliteConnectOptions::new().filename(path),
            ConnectionTarget::Dsn(dsn) => SqliteConnectOptions::from_str(dsn)
                .map_err(|e| DbError::configuration(&descriptor.name, e.to_string()))?,
            ConnectionTarget::Network { .. } => {
                return Err(DbError::configuration(
                    &descriptor.name,
                    "SQLite needs a file path or a sqlite: connection string",
                ));
            }
        };

        Ok(options
            .read_only(descriptor.read_only)
            .create_if_missing(!descriptor.read_only)
            .busy_timeout(BUSY_TIMEOUT))
    }

    fn check_schema(schema: Option<&str>, operation: &str) -> DbResult<()> {
        match schema {
            None => Ok(()),
            Some(s) if s.eq_ignore_ascii_case(MAIN_SCHEMA) => Ok(()),
            Some(_) => Err(DbError::unsupported("", operation)),
        }
    }
}

#[async_trait]
impl DialectAdapter for SqliteAdapter {
    type Connection = SqliteConnection;

    fn backend_type(&self) -> BackendType {
        BackendType::Sqlite
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn check_descriptor(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        Self::connect_options(descriptor).map(|_| ())
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<SqliteConnection> {
        let options = Self::connect_options(descriptor)?;
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| open_failed(BackendType::Sqlite, &e))?;
        debug!(
            backend = %descriptor.name,
            read_only = descriptor.read_only,
            "Opened SQLite connection"
        );
        Ok(conn)
    }

    async fn ping(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn server_version(&self, conn: &mut SqliteConnection) -> DbResult<String> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "test_connection"))?;
        Ok(format!("SQLite {version}"))
    }

    async fn list_schemas(&self, _conn: &mut SqliteConnection) -> DbResult<Vec<String>> {
        Err(DbError::unsupported("", "list_schemas"))
    }

    async fn list_tables(
        &self,
        conn: &mut SqliteConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        Self::check_schema(schema, "list_tables with a schema other than main")?;
        sqlx::query_scalar::<_, String>(queries::LIST_TABLES)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "list_tables"))
    }

    async fn describe_table(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        Self::check_schema(schema, "describe_table with a schema other than main")?;
        let rows = sqlx::query(queries::DESCRIBE_COLUMNS)
            .bind(table)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "describe_table"))?;

        if rows.is_empty() {
            return Err(DbError::table_not_found(table));
        }

        let mut table_schema = TableSchema::new(table).with_schema(schema);
        for row in &rows {
            let cid: i64 = row.get("cid");
            let native: String = row.get("type");
            let not_null: i64 = row.get("notnull");
            let pk: i64 = row.get("pk");
            // Columns declared without a type carry no affinity.
            let data_type = if native.is_empty() {
                "any".to_string()
            } else {
                normalize_type_name(&native, BackendType::Sqlite)
            };

            table_schema = table_schema.with_column(
                ColumnDefinition::new(row.get::<String, _>("name"), data_type, native, cid as u32 + 1)
                    .with_nullable(not_null == 0 && pk == 0)
                    .with_primary_key(pk > 0)
                    .with_default(row.get("dflt_value")),
            );
        }
        Ok(table_schema)
    }

    async fn execute(
        &self,
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet> {
        let results: Vec<Result<SqliteRow, sqlx::Error>> = if params.is_empty() {
            Executor::fetch(&mut *conn, sql)
                .take(fetch_limit)
                .collect()
                .await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_param(query, param);
            }
            query.fetch(&mut *conn).take(fetch_limit).collect().await
        };

        let rows = results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DbError::driver(e, "execute_query"))?;

        let columns = match rows.first() {
            Some(row) => row.column_info(),
            None => match Executor::prepare(&mut *conn, sql).await {
                Ok(statement) => column_infos(statement.columns()),
                Err(e) => {
                    warn!(error = %e, "Could not describe result columns");
                    Vec::new()
                }
            },
        };

        Ok(RawResultSet::new(
            columns,
            rows.iter().map(RowDecode::decode_values).collect(),
        ))
    }

    fn sample_query(&self, table: &str, schema: Option<&str>, limit: u32) -> DbResult<String> {
        Self::check_schema(schema, "sample_data")?;
        Ok(format!(
            "SELECT * FROM {} LIMIT {limit}",
            quote_identifier(table, '"')
        ))
    }

    async fn close(&self, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing SQLite connection");
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(b) => query.bind(*b),
        QueryParam::Int(i) => query.bind(*i),
        QueryParam::Float(f) => query.bind(*f),
        QueryParam::String(s) => query.bind(s.as_str()),
        QueryParam::Bytes { base64 } => query.bind(base64.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_scratch(dir: &TempDir) -> SqliteConnection {
        let descriptor =
            ConnectionDescriptor::sqlite("scratch", dir.path().join("t.db")).with_read_only(false);
        let mut conn = SqliteAdapter.open(&descriptor).await.unwrap();
        Executor::execute(
            &mut conn,
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, note)",
        )
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_describe_reports_columns_in_order() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_scratch(&dir).await;

        let schema = SqliteAdapter
            .describe_table(&mut conn, "people", None)
            .await
            .unwrap();
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "name", "note"]);
        assert!(schema.columns[0].primary_key);
        assert!(!schema.columns[1].nullable);
        assert_eq!(schema.columns[1].data_type, "text");
        assert_eq!(schema.columns[2].data_type, "any");
    }

    #[tokio::test]
    async fn test_other_schema_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_scratch(&dir).await;

        assert!(SqliteAdapter.list_tables(&mut conn, Some("main")).await.is_ok());
        let err = SqliteAdapter
            .list_tables(&mut conn, Some("archive"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_scratch(&dir).await;

        let raw = SqliteAdapter
            .execute(&mut conn, "SELECT id, name FROM people", &[], 11)
            .await
            .unwrap();
        assert!(raw.rows.is_empty());
        let names: Vec<_> = raw.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "name"]);
    }

    #[test]
    fn test_sample_query() {
        assert_eq!(
            SqliteAdapter.sample_query("people", Some("main"), 10).unwrap(),
            "SELECT * FROM \"people\" LIMIT 10"
        );
        let err = SqliteAdapter.sample_query("people", Some("archive"), 10).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedOperation);
    }
}
