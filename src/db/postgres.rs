//! PostgreSQL adapter over `sqlx::PgConnection`.

use std::str::FromStr;

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Connection, Executor, Postgres, Row, Statement};
use tracing::{debug, warn};

use crate::db::adapter::{DialectAdapter, PlaceholderStyle, open_failed, qualified_name};
use crate::db::normalize::RawResultSet;
use crate::db::types::{RowDecode, column_infos, normalize_type_name};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendType, ColumnDefinition, ConnectionDescriptor, ConnectionTarget, QueryParam, SslMode,
    TableSchema,
};

mod queries {
    pub const LIST_SCHEMAS: &str = r#"
        SELECT schema_name::text
        FROM information_schema.schemata
        WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
        AND schema_name NOT LIKE 'pg_toast%'
        AND schema_name NOT LIKE 'pg_temp_%'
        ORDER BY schema_name
        "#;

    pub const LIST_TABLES: &str = r#"
        SELECT table_name::text
        FROM information_schema.tables
        WHERE table_schema = $1
        AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#;

    pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            c.column_name::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            c.is_nullable::text AS is_nullable,
            c.column_default::text AS column_default,
            c.ordinal_position::int4 AS ordinal_position,
            CASE WHEN pk.column_name IS NOT NULL THEN true ELSE false END AS is_primary_key
        FROM information_schema.columns c
        JOIN pg_class t ON t.relname = c.table_name
        JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        LEFT JOIN (
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_name = $1
            AND tc.table_schema = $2
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_name = $1 AND c.table_schema = $2
        ORDER BY c.ordinal_position
        "#;
}

const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn connect_options(descriptor: &ConnectionDescriptor) -> DbResult<PgConnectOptions> {
        let mut options = match &descriptor.target {
            ConnectionTarget::Dsn(dsn) => PgConnectOptions::from_str(dsn)
                .map_err(|e| DbError::configuration(&descriptor.name, e.to_string()))?,
            ConnectionTarget::Network {
                host,
                port,
                database,
            } => PgConnectOptions::new()
                .host(host)
                .port(port.unwrap_or(5432))
                .database(database),
            ConnectionTarget::File { .. } => {
                return Err(DbError::configuration(
                    &descriptor.name,
                    "PostgreSQL needs a host or a postgres:// connection string",
                ));
            }
        };

        if let Some(credentials) = &descriptor.credentials {
            options = options.username(&credentials.username);
            if let Some(password) = &credentials.password {
                options = options.password(password.expose_secret());
            }
        }

        // Only override what the DSN carried when SSL was configured explicitly.
        if descriptor.ssl.mode != SslMode::Prefer
            || !matches!(descriptor.target, ConnectionTarget::Dsn(_))
        {
            options = options.ssl_mode(match descriptor.ssl.mode {
                SslMode::Disable => PgSslMode::Disable,
                SslMode::Prefer => PgSslMode::Prefer,
                SslMode::Require => PgSslMode::Require,
                SslMode::VerifyCa => PgSslMode::VerifyCa,
                SslMode::VerifyFull => PgSslMode::VerifyFull,
            });
        }
        if let Some(cert) = &descriptor.ssl.root_cert {
            options = options.ssl_root_cert(cert);
        }

        Ok(options.application_name(env!("CARGO_PKG_NAME")))
    }
}

#[async_trait]
impl DialectAdapter for PostgresAdapter {
    type Connection = PgConnection;

    fn backend_type(&self) -> BackendType {
        BackendType::Postgres
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::DollarNumbered
    }

    fn check_descriptor(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        Self::connect_options(descriptor).map(|_| ())
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<PgConnection> {
        let options = Self::connect_options(descriptor)?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| open_failed(BackendType::Postgres, &e))?;

        if descriptor.read_only {
            Executor::execute(
                &mut conn,
                "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY",
            )
            .await
            .map_err(|e| DbError::driver(e, "open"))?;
        }

        debug!(backend = %descriptor.name, "Opened PostgreSQL connection");
        Ok(conn)
    }

    async fn ping(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn server_version(&self, conn: &mut PgConnection) -> DbResult<String> {
        sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "test_connection"))
    }

    async fn list_schemas(&self, conn: &mut PgConnection) -> DbResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(queries::LIST_SCHEMAS)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "list_schemas"))
    }

    async fn list_tables(
        &self,
        conn: &mut PgConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(queries::LIST_TABLES)
            .bind(schema.unwrap_or(DEFAULT_SCHEMA))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "list_tables"))
    }

    async fn describe_table(
        &self,
        conn: &mut PgConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = sqlx::query(queries::DESCRIBE_COLUMNS)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DbError::driver(e, "describe_table"))?;

        if rows.is_empty() {
            return Err(DbError::table_not_found(format!("{schema}.{table}")));
        }

        let mut table_schema = TableSchema::new(table).with_schema(Some(schema));
        for row in &rows {
            let name: String = row.get("column_name");
            let native: String = row.get("column_type");
            let nullable: String = row.get("is_nullable");
            let ordinal: i32 = row.get("ordinal_position");

            table_schema = table_schema.with_column(
                ColumnDefinition::new(
                    name,
                    normalize_type_name(&native, BackendType::Postgres),
                    native,
                    ordinal.max(0) as u32,
                )
                .with_nullable(nullable == "YES")
                .with_primary_key(row.get("is_primary_key"))
                .with_default(row.get("column_default")),
            );
        }
        Ok(table_schema)
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet> {
        let results: Vec<Result<PgRow, sqlx::Error>> = if params.is_empty() {
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
            qualified_name(table, Some(schema.unwrap_or(DEFAULT_SCHEMA)), '"')
        ))
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing PostgreSQL connection");
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> Query<'q, Postgres, PgArguments> {
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
    use crate::models::SslOptions;

    #[test]
    fn test_sample_query_quotes_identifiers() {
        let sql = PostgresAdapter.sample_query("Order Items", None, 10).unwrap();
        assert_eq!(sql, "SELECT * FROM \"public\".\"Order Items\" LIMIT 10");
        let sql = PostgresAdapter.sample_query("t", Some("sales"), 5).unwrap();
        assert_eq!(sql, "SELECT * FROM \"sales\".\"t\" LIMIT 5");
    }

    #[test]
    fn test_connect_options_from_fields() {
        let descriptor = ConnectionDescriptor::new(
            "pg",
            BackendType::Postgres,
            ConnectionTarget::Network {
                host: "db.internal".into(),
                port: None,
                database: "app".into(),
            },
        )
        .with_credentials("reader", Some("secret".into()))
        .with_ssl(SslOptions {
            mode: SslMode::Require,
            root_cert: None,
        });

        let options = PostgresAdapter::connect_options(&descriptor).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("app"));
        assert_eq!(options.get_username(), "reader");
    }

    #[test]
    fn test_connect_options_rejects_bad_dsn() {
        let descriptor = ConnectionDescriptor::new(
            "pg",
            BackendType::Postgres,
            ConnectionTarget::Dsn("postgres://u@host:notaport/db".into()),
        );
        let err = PostgresAdapter.check_descriptor(&descriptor).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationError);
    }
}
