//! IBM DB2 adapter over ODBC.
//!
//! `odbc-api` is blocking, so every call moves the connection into
//! `spawn_blocking` and back. Values are fetched in text form and typed from
//! the column's ODBC data type.

use std::sync::OnceLock;

use async_trait::async_trait;
use odbc_api::parameter::InputParameter;
use odbc_api::{
    Bit, Connection, ConnectionOptions, Cursor, CursorRow, DataType, Environment, IntoParameter,
    ResultSetMetadata,
};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::db::adapter::{DialectAdapter, PlaceholderStyle, open_failed, qualified_name};
use crate::db::normalize::{self, RawResultSet};
use crate::db::types::normalize_type_name;
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendType, ColumnDefinition, ColumnInfo, ConnectionDescriptor, ConnectionTarget, QueryParam,
    ScalarValue, SslMode, TableSchema,
};

const DEFAULT_DRIVER: &str = "IBM DB2 ODBC DRIVER";

mod queries {
    pub const VERSION: &str =
        "SELECT SERVICE_LEVEL FROM TABLE (SYSPROC.ENV_GET_INST_INFO()) AS INSTANCEINFO";

    pub const PING: &str = "SELECT 1 FROM SYSIBM.SYSDUMMY1";

    pub const CURRENT_SCHEMA: &str = "SELECT CURRENT SCHEMA FROM SYSIBM.SYSDUMMY1";

    pub const LIST_SCHEMAS: &str = r#"
        SELECT RTRIM(SCHEMANAME) FROM SYSCAT.SCHEMATA
        WHERE SCHEMANAME NOT LIKE 'SYS%' AND SCHEMANAME <> 'NULLID'
        ORDER BY SCHEMANAME
        "#;

    pub const LIST_TABLES: &str = r#"
        SELECT RTRIM(TABNAME) FROM SYSCAT.TABLES
        WHERE TABSCHEMA = ? AND TYPE = 'T'
        ORDER BY TABNAME
        "#;

    pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT COLNAME, RTRIM(TYPENAME), LENGTH, SCALE, NULLS, DEFAULT, COLNO, KEYSEQ
        FROM SYSCAT.COLUMNS
        WHERE TABSCHEMA = ? AND TABNAME = ?
        ORDER BY COLNO
        "#;
}

static ENVIRONMENT: OnceLock<Result<Environment, String>> = OnceLock::new();

fn environment() -> DbResult<&'static Environment> {
    ENVIRONMENT
        .get_or_init(|| Environment::new().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|msg| {
            DbError::connection(
                format!("ODBC environment unavailable: {msg}"),
                "Install unixODBC and the IBM DB2 ODBC driver",
            )
        })
}

/// A DB2 connection that can be lent to a blocking worker.
pub struct Db2Connection {
    inner: Option<Connection<'static>>,
}

impl Db2Connection {
    /// Run `f` on the blocking pool with the connection moved in.
    ///
    /// If the worker panics the connection is gone and later calls fail with a
    /// connection error, which makes the pool discard the handle.
    async fn with<T, F>(&mut self, operation: &'static str, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection<'static>) -> DbResult<T> + Send + 'static,
    {
        let conn = self.inner.take().ok_or_else(|| {
            DbError::connection(
                "DB2 connection is no longer available",
                "Retry the request; a new connection will be opened",
            )
        })?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| DbError::internal(format!("DB2 worker failed during {operation}: {e}")))?;

        self.inner = Some(conn);
        result
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Db2Adapter;

impl Db2Adapter {
    /// Build the ODBC connection string, credentials included.
    pub fn connection_string(descriptor: &ConnectionDescriptor) -> DbResult<String> {
        let (host, port, database) = match &descriptor.target {
            ConnectionTarget::Dsn(dsn) => return Ok(dsn.clone()),
            ConnectionTarget::Network {
                host,
                port,
                database,
            } => (host, port.unwrap_or(50000), database),
            ConnectionTarget::File { .. } => {
                return Err(DbError::configuration(
                    &descriptor.name,
                    "DB2 needs a host or an ODBC connection string",
                ));
            }
        };

        let driver = descriptor.odbc_driver.as_deref().unwrap_or(DEFAULT_DRIVER);
        let mut out = format!(
            "Driver={{{driver}}};Database={database};Hostname={host};Port={port};Protocol=TCPIP;"
        );
        if let Some(credentials) = &descriptor.credentials {
            out.push_str(&format!("Uid={};", credentials.username));
            if let Some(password) = &credentials.password {
                out.push_str(&format!("Pwd={};", password.expose_secret()));
            }
        }
        if !matches!(descriptor.ssl.mode, SslMode::Disable | SslMode::Prefer) {
            out.push_str("Security=SSL;");
            if let Some(cert) = &descriptor.ssl.root_cert {
                out.push_str(&format!("SSLServerCertificate={};", cert.display()));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DialectAdapter for Db2Adapter {
    type Connection = Db2Connection;

    fn backend_type(&self) -> BackendType {
        BackendType::Db2
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn check_descriptor(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        Self::connection_string(descriptor).map(|_| ())
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<Db2Connection> {
        let connection_string = Self::connection_string(descriptor)?;
        let env = environment()?;

        let conn = tokio::task::spawn_blocking(move || {
            env.connect_with_connection_string(&connection_string, ConnectionOptions::default())
        })
        .await
        .map_err(|e| DbError::internal(format!("DB2 connect worker failed: {e}")))?
        .map_err(|e| open_failed(BackendType::Db2, &e))?;

        debug!(backend = %descriptor.name, "Opened DB2 connection");
        Ok(Db2Connection { inner: Some(conn) })
    }

    async fn ping(&self, conn: &mut Db2Connection) -> bool {
        conn.with("ping", |c| fetch(c, queries::PING, &[], 1))
            .await
            .is_ok()
    }

    async fn server_version(&self, conn: &mut Db2Connection) -> DbResult<String> {
        conn.with("test_connection", |c| {
            let raw = fetch(c, queries::VERSION, &[], 1)?;
            Ok(first_text(&raw).unwrap_or_else(|| "DB2".to_string()))
        })
        .await
    }

    async fn list_schemas(&self, conn: &mut Db2Connection) -> DbResult<Vec<String>> {
        conn.with("list_schemas", |c| {
            fetch(c, queries::LIST_SCHEMAS, &[], usize::MAX).map(|raw| texts(&raw, 0))
        })
        .await
    }

    async fn list_tables(
        &self,
        conn: &mut Db2Connection,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let schema = schema.map(catalog_name);
        conn.with("list_tables", move |c| {
            let schema = resolve_schema(c, schema)?;
            fetch(c, queries::LIST_TABLES, &[QueryParam::String(schema)], usize::MAX)
                .map(|raw| texts(&raw, 0))
        })
        .await
    }

    async fn describe_table(
        &self,
        conn: &mut Db2Connection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let table = catalog_name(table);
        let schema = schema.map(catalog_name);
        conn.with("describe_table", move |c| {
            let schema = resolve_schema(c, schema)?;
            let raw = fetch(
                c,
                queries::DESCRIBE_COLUMNS,
                &[QueryParam::String(schema.clone()), QueryParam::String(table.clone())],
                usize::MAX,
            )?;
            if raw.rows.is_empty() {
                return Err(DbError::table_not_found(format!("{schema}.{table}")));
            }

            let mut table_schema = TableSchema::new(&table).with_schema(Some(&schema));
            for row in &raw.rows {
                let text = |i: usize| row.get(i).map(ScalarValue::display_text).unwrap_or_default();
                let type_name = text(1);
                let native = match type_name.as_str() {
                    "DECIMAL" | "NUMERIC" => format!("{type_name}({},{})", text(2), text(3)),
                    "CHARACTER" | "VARCHAR" | "GRAPHIC" | "VARGRAPHIC" => {
                        format!("{type_name}({})", text(2))
                    }
                    _ => type_name,
                };
                let default = row.get(5).filter(|v| !v.is_null()).map(ScalarValue::display_text);
                let ordinal = text(6).trim().parse::<u32>().unwrap_or(0) + 1;

                table_schema = table_schema.with_column(
                    ColumnDefinition::new(
                        text(0),
                        normalize_type_name(&native, BackendType::Db2),
                        native,
                        ordinal,
                    )
                    .with_nullable(text(4).trim() == "Y")
                    .with_primary_key(row.get(7).is_some_and(|v| !v.is_null()))
                    .with_default(default),
                );
            }
            Ok(table_schema)
        })
        .await
    }

    async fn execute(
        &self,
        conn: &mut Db2Connection,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet> {
        let sql = sql.to_string();
        let params = params.to_vec();
        conn.with("execute_query", move |c| fetch(c, &sql, &params, fetch_limit))
            .await
    }

    fn sample_query(&self, table: &str, schema: Option<&str>, limit: u32) -> DbResult<String> {
        let table = catalog_name(table);
        let schema = schema.map(catalog_name);
        Ok(format!(
            "SELECT * FROM {} FETCH FIRST {limit} ROWS ONLY",
            qualified_name(&table, schema.as_deref(), '"')
        ))
    }

    async fn close(&self, mut conn: Db2Connection) {
        // Dropping the handle disconnects, which blocks on the network.
        if let Some(inner) = conn.inner.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || drop(inner)).await {
                debug!(error = %e, "Error closing DB2 connection");
            }
        }
    }
}

/// DB2 folds unquoted identifiers to upper case; mixed-case names are kept.
fn catalog_name(name: &str) -> String {
    if name.chars().any(|c| c.is_ascii_uppercase()) {
        name.to_string()
    } else {
        name.to_ascii_uppercase()
    }
}

fn resolve_schema(conn: &Connection<'static>, schema: Option<String>) -> DbResult<String> {
    match schema {
        Some(schema) => Ok(schema),
        None => {
            let raw = fetch(conn, queries::CURRENT_SCHEMA, &[], 1)?;
            first_text(&raw).map(|s| s.trim_end().to_string()).ok_or_else(|| {
                DbError::execution("list_tables", "Could not resolve CURRENT SCHEMA", None)
            })
        }
    }
}

fn first_text(raw: &RawResultSet) -> Option<String> {
    raw.rows
        .first()
        .and_then(|row| row.first())
        .filter(|v| !v.is_null())
        .map(ScalarValue::display_text)
}

fn texts(raw: &RawResultSet, column: usize) -> Vec<String> {
    raw.rows
        .iter()
        .filter_map(|row| row.get(column))
        .map(ScalarValue::display_text)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Text,
}

impl From<DataType> for ValueKind {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt => {
                Self::Integer
            }
            DataType::Real | DataType::Float { .. } | DataType::Double => Self::Float,
            DataType::Decimal { .. } | DataType::Numeric { .. } => Self::Decimal,
            DataType::Bit => Self::Boolean,
            DataType::Date => Self::Date,
            DataType::Time { .. } => Self::Time,
            DataType::Timestamp { .. } => Self::Timestamp,
            DataType::Binary { .. } | DataType::Varbinary { .. } | DataType::LongVarbinary { .. } => {
                Self::Binary
            }
            _ => Self::Text,
        }
    }
}

fn odbc_error(err: odbc_api::Error, operation: &str) -> DbError {
    let sql_state = match &err {
        odbc_api::Error::Diagnostics { record, .. } => Some(record.state.as_str().to_string()),
        _ => None,
    };
    match sql_state.as_deref() {
        // Class 08 is connection exception.
        Some(state) if state.starts_with("08") => DbError::connection(
            err.to_string(),
            "Check network connectivity and DB2 server status",
        ),
        _ => DbError::execution(operation, err.to_string(), sql_state),
    }
}

fn to_parameter(param: &QueryParam) -> Box<dyn InputParameter> {
    match param {
        QueryParam::Null => Box::new(None::<String>.into_parameter()),
        QueryParam::Bool(b) => Box::new(Bit::from_bool(*b)),
        QueryParam::Int(i) => Box::new(*i),
        QueryParam::Float(f) => Box::new(*f),
        QueryParam::String(s) => Box::new(s.clone().into_parameter()),
        QueryParam::Bytes { base64 } => Box::new(base64.clone().into_parameter()),
    }
}

/// Execute `sql` and read at most `fetch_limit` rows.
fn fetch(
    conn: &Connection<'static>,
    sql: &str,
    params: &[QueryParam],
    fetch_limit: usize,
) -> DbResult<RawResultSet> {
    let bound: Vec<Box<dyn InputParameter>> = params.iter().map(to_parameter).collect();
    let Some(mut cursor) = conn
        .execute(sql, bound.as_slice(), None)
        .map_err(|e| odbc_error(e, "execute_query"))?
    else {
        return Ok(RawResultSet::default());
    };

    let column_count = cursor
        .num_result_cols()
        .map_err(|e| odbc_error(e, "execute_query"))?;
    let mut columns = Vec::new();
    let mut kinds = Vec::new();
    for index in 1..=column_count.max(0) as u16 {
        let name = cursor
            .col_name(index)
            .map_err(|e| odbc_error(e, "execute_query"))?;
        let data_type = cursor
            .col_data_type(index)
            .map_err(|e| odbc_error(e, "execute_query"))?;
        columns.push(ColumnInfo::new(name, format!("{data_type:?}")));
        kinds.push(ValueKind::from(data_type));
    }

    let mut rows = Vec::new();
    let mut buf = Vec::new();
    while rows.len() < fetch_limit {
        let Some(mut row) = cursor
            .next_row()
            .map_err(|e| odbc_error(e, "execute_query"))?
        else {
            break;
        };
        let mut values = Vec::with_capacity(kinds.len());
        for (index, kind) in kinds.iter().enumerate() {
            values.push(read_value(&mut row, index as u16 + 1, *kind, &mut buf)?);
        }
        rows.push(values);
    }

    Ok(RawResultSet::new(columns, rows))
}

fn read_value(
    row: &mut CursorRow<'_>,
    column: u16,
    kind: ValueKind,
    buf: &mut Vec<u8>,
) -> DbResult<ScalarValue> {
    buf.clear();
    if kind == ValueKind::Binary {
        let present = row
            .get_binary(column, buf)
            .map_err(|e| odbc_error(e, "execute_query"))?;
        return Ok(if present {
            normalize::binary(buf)
        } else {
            ScalarValue::Null
        });
    }

    let present = row
        .get_text(column, buf)
        .map_err(|e| odbc_error(e, "execute_query"))?;
    if !present {
        return Ok(ScalarValue::Null);
    }
    Ok(text_value(String::from_utf8_lossy(buf).into_owned(), kind))
}

fn text_value(text: String, kind: ValueKind) -> ScalarValue {
    let trimmed = text.trim();
    match kind {
        ValueKind::Integer => trimmed
            .parse::<i64>()
            .map(ScalarValue::Int)
            .unwrap_or_else(|_| ScalarValue::Decimal(trimmed.to_string())),
        ValueKind::Float => trimmed
            .parse::<f64>()
            .map(normalize::float)
            .unwrap_or(ScalarValue::Text(text)),
        ValueKind::Decimal => ScalarValue::Decimal(trimmed.to_string()),
        ValueKind::Boolean => ScalarValue::Bool(matches!(trimmed, "1" | "true" | "TRUE")),
        ValueKind::Date => ScalarValue::Date(trimmed.to_string()),
        ValueKind::Time => ScalarValue::Time(trimmed.to_string()),
        ValueKind::Timestamp => ScalarValue::Timestamp(trimmed.replacen(' ', "T", 1)),
        ValueKind::Binary | ValueKind::Text => ScalarValue::Text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_from_fields() {
        let descriptor = ConnectionDescriptor::new(
            "warehouse",
            BackendType::Db2,
            ConnectionTarget::Network {
                host: "db2.internal".into(),
                port: None,
                database: "SAMPLE".into(),
            },
        )
        .with_credentials("db2inst1", Some("pw".into()));

        let conn_str = Db2Adapter::connection_string(&descriptor).unwrap();
        assert!(conn_str.starts_with("Driver={IBM DB2 ODBC DRIVER};"));
        assert!(conn_str.contains("Hostname=db2.internal;Port=50000;"));
        assert!(conn_str.contains("Uid=db2inst1;Pwd=pw;"));
        assert!(!conn_str.contains("Security=SSL"));
    }

    #[test]
    fn test_sample_query_fetch_first() {
        assert_eq!(
            Db2Adapter.sample_query("orders", Some("sales"), 10).unwrap(),
            "SELECT * FROM \"SALES\".\"ORDERS\" FETCH FIRST 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_text_values_are_typed() {
        assert_eq!(text_value("42".into(), ValueKind::Integer), ScalarValue::Int(42));
        assert_eq!(
            text_value("12.50".into(), ValueKind::Decimal),
            ScalarValue::Decimal("12.50".into())
        );
        assert_eq!(
            text_value("2024-01-02 03:04:05.000000".into(), ValueKind::Timestamp),
            ScalarValue::Timestamp("2024-01-02T03:04:05.000000".into())
        );
    }
}
