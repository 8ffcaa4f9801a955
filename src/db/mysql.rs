//! MySQL / MariaDB adapter over `sqlx::MySqlConnection`.

use std::str::FromStr;

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::ExposeSecret;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Connection, Executor, MySql, Row, Statement};
use tracing::{debug, warn};

use crate::db::adapter::{DialectAdapter, PlaceholderStyle, open_failed, qualified_name};
use crate::db::normalize::RawResultSet;
use crate::db::types::{RowDecode, column_infos, normalize_type_name};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendType, ColumnDefinition, ConnectionDescriptor, ConnectionTarget, QueryParam, SslMode,
    TableSchema,
};

/// Catalog queries. MySQL may hand information_schema text back as
/// VARBINARY depending on the connection charset, hence the CONVERTs.
mod queries {
    pub const LIST_SCHEMAS: &str = r#"
        SELECT CONVERT(SCHEMA_NAME USING utf8mb4) AS SCHEMA_NAME
        FROM information_schema.SCHEMATA
        WHERE SCHEMA_NAME NOT IN ('mysql', 'sys', 'performance_schema', 'information_schema')
        ORDER BY SCHEMA_NAME
        "#;

    pub const LIST_TABLES: &str = r#"
        SELECT CONVERT(TABLE_NAME USING utf8mb4) AS TABLE_NAME
        FROM information_schema.TABLES
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
        AND TABLE_TYPE = 'BASE TABLE'
        ORDER BY TABLE_NAME
        "#;

    pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8mb4) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8mb4) AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8mb4) AS COLUMN_DEFAULT,
            CONVERT(COLUMN_KEY USING utf8mb4) AS COLUMN_KEY,
            CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
        FROM information_schema.COLUMNS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        ORDER BY ORDINAL_POSITION
        "#;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlAdapter;

impl MySqlAdapter {
    pub fn connect_options(descriptor: &ConnectionDescriptor) -> DbResult<MySqlConnectOptions> {
        let mut options = match &descriptor.target {
            ConnectionTarget::Dsn(dsn) => MySqlConnectOptions::from_str(dsn)
                .map_err(|e| DbError::configuration(&descriptor.name, e.to_string()))?,
            ConnectionTarget::Network {
                host,
                port,
                database,
            } => MySqlConnectOptions::new()
                .host(host)
                .port(port.unwrap_or(3306))
                .database(database),
            ConnectionTarget::File { .. } => {
                return Err(DbError::configuration(
                    &descriptor.name,
                    "MySQL needs a host or a mysql:// connection string",
                ));
            }
        };

        if let Some(credentials) = &descriptor.credentials {
            options = options.username(&credentials.username);
            if let Some(password) = &credentials.password {
                options = options.password(password.expose_secret());
            }
        }

        if descriptor.ssl.mode != SslMode::Prefer
            || !matches!(descriptor.target, ConnectionTarget::Dsn(_))
        {
            options = options.ssl_mode(match descriptor.ssl.mode {
                SslMode::Disable => MySqlSslMode::Disabled,
                SslMode::Prefer => MySqlSslMode::Preferred,
                SslMode::Require => MySqlSslMode::Required,
                SslMode::VerifyCa => MySqlSslMode::VerifyCa,
                SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
            });
        }
        if let Some(cert) = &descriptor.ssl.root_cert {
            options = options.ssl_ca(cert);
        }

        Ok(options.charset("utf8mb4"))
    }
}

#[async_trait]
impl DialectAdapter for MySqlAdapter {
    type Connection = MySqlConnection;

    fn backend_type(&self) -> BackendType {
        BackendType::MySql
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn check_descriptor(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        Self::connect_options(descriptor).map(|_| ())
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<MySqlConnection> {
        let options = Self::connect_options(descriptor)?;
        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| open_failed(BackendType::MySql, &e))?;

        if descriptor.read_only {
            Executor::execute(&mut conn, "SET SESSION TRANSACTION READ ONLY")
                .await
                .map_err(|e| DbError::driver(e, "open"))?;
        }

        debug!(backend = %descriptor.name, "Opened MySQL connection");
        Ok(conn)
    }

    async fn ping(&self, conn: &mut MySqlConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn server_version(&self, conn: &mut MySqlConnection) -> DbResult<String> {
        let row = sqlx::query("SELECT VERSION()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "test_connection"))?;
        Ok(get_string(&row, 0usize))
    }

    async fn list_schemas(&self, conn: &mut MySqlConnection) -> DbResult<Vec<String>> {
        let rows = sqlx::query(queries::LIST_SCHEMAS)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "list_schemas"))?;
        Ok(rows.iter().map(|row| get_string(row, 0usize)).collect())
    }

    async fn list_tables(
        &self,
        conn: &mut MySqlConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let rows = sqlx::query(queries::LIST_TABLES)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "list_tables"))?;
        Ok(rows.iter().map(|row| get_string(row, 0usize)).collect())
    }

    async fn describe_table(
        &self,
        conn: &mut MySqlConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let rows = sqlx::query(queries::DESCRIBE_COLUMNS)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "describe_table"))?;

        if rows.is_empty() {
            let name = match schema {
                Some(schema) => format!("{schema}.{table}"),
                None => table.to_string(),
            };
            return Err(DbError::table_not_found(name));
        }

        let mut table_schema = TableSchema::new(table).with_schema(schema);
        for (index, row) in rows.iter().enumerate() {
            let native = get_string(row, "COLUMN_TYPE");
            let ordinal = row
                .try_get::<Option<i64>, _>("ORDINAL_POSITION")
                .ok()
                .flatten()
                .unwrap_or(index as i64 + 1);

            table_schema = table_schema.with_column(
                ColumnDefinition::new(
                    get_string(row, "COLUMN_NAME"),
                    normalize_type_name(&native, BackendType::MySql),
                    native,
                    ordinal.max(0) as u32,
                )
                .with_nullable(get_string(row, "IS_NULLABLE") == "YES")
                .with_primary_key(get_string(row, "COLUMN_KEY") == "PRI")
                .with_default(get_optional_string(row, "COLUMN_DEFAULT")),
            );
        }
        Ok(table_schema)
    }

    async fn execute(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet> {
        let results: Vec<Result<MySqlRow, sqlx::Error>> = if params.is_empty() {
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
        Ok(format!(
            "SELECT * FROM {} LIMIT {limit}",
            qualified_name(table, schema, '`')
        ))
    }

    async fn close(&self, conn: MySqlConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing MySQL connection");
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(b) => query.bind(*b),
        QueryParam::Int(i) => query.bind(*i),
        QueryParam::Float(f) => query.bind(*f),
        QueryParam::String(s) => query.bind(s.as_str()),
        QueryParam::Bytes { base64 } => query.bind(base64.as_slice()),
    }
}

/// Read a text column, falling back to VARBINARY bytes.
fn get_string<I>(row: &MySqlRow, column: I) -> String
where
    I: sqlx::ColumnIndex<MySqlRow> + Copy,
{
    get_optional_string(row, column).unwrap_or_default()
}

fn get_optional_string<I>(row: &MySqlRow, column: I) -> Option<String>
where
    I: sqlx::ColumnIndex<MySqlRow> + Copy,
{
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}
