//! Dialect adapter contract.
//!
//! Each backend type implements [`DialectAdapter`] over its own native driver.
//! Adapters own their catalog queries, identifier quoting and placeholder
//! syntax; nothing backend-specific lives in the shared code above them.

use async_trait::async_trait;

use crate::db::normalize::RawResultSet;
use crate::error::{DbError, DbResult};
use crate::models::{BackendType, ConnectionDescriptor, QueryParam, TableSchema};

/// Parameter placeholder syntax a driver expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`, bound in order of appearance
    QuestionMark,
    /// `$1`, `$2`, ... bound by index
    DollarNumbered,
}

#[async_trait]
pub trait DialectAdapter: Send + Sync + 'static {
    /// Native connection handle.
    type Connection: Send + 'static;

    fn backend_type(&self) -> BackendType;

    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Reject descriptors this driver cannot use, before any connection is opened.
    fn check_descriptor(&self, _descriptor: &ConnectionDescriptor) -> DbResult<()> {
        Ok(())
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> DbResult<Self::Connection>;

    async fn ping(&self, conn: &mut Self::Connection) -> bool;

    async fn server_version(&self, conn: &mut Self::Connection) -> DbResult<String>;

    /// Fails with [`DbError::UnsupportedOperation`] where schemas are not a concept.
    async fn list_schemas(&self, conn: &mut Self::Connection) -> DbResult<Vec<String>>;

    async fn list_tables(
        &self,
        conn: &mut Self::Connection,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>>;

    async fn describe_table(
        &self,
        conn: &mut Self::Connection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema>;

    /// Run a validated statement, stopping after `fetch_limit` rows.
    ///
    /// Parameters always go through the driver's binding path.
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: usize,
    ) -> DbResult<RawResultSet>;

    /// `SELECT * FROM <table>` capped at `limit` rows, in this dialect.
    ///
    /// Fails the same way `describe_table` does for a schema the backend
    /// cannot address.
    fn sample_query(&self, table: &str, schema: Option<&str>, limit: u32) -> DbResult<String>;

    async fn close(&self, conn: Self::Connection);
}

/// One unit of work against a borrowed connection.
#[derive(Debug, Clone)]
pub enum Operation {
    ServerVersion,
    ListSchemas,
    ListTables {
        schema: Option<String>,
    },
    DescribeTable {
        table: String,
        schema: Option<String>,
    },
    Execute {
        sql: String,
        params: Vec<QueryParam>,
        fetch_limit: usize,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerVersion => "test_connection",
            Self::ListSchemas => "list_schemas",
            Self::ListTables { .. } => "list_tables",
            Self::DescribeTable { .. } => "describe_table",
            Self::Execute { .. } => "execute_query",
        }
    }
}

#[derive(Debug)]
pub enum OperationOutput {
    Version(String),
    Names(Vec<String>),
    Table(TableSchema),
    Rows(RawResultSet),
}

impl OperationOutput {
    pub fn into_version(self) -> DbResult<String> {
        match self {
            Self::Version(v) => Ok(v),
            other => Err(unexpected("version", &other)),
        }
    }

    pub fn into_names(self) -> DbResult<Vec<String>> {
        match self {
            Self::Names(names) => Ok(names),
            other => Err(unexpected("names", &other)),
        }
    }

    pub fn into_table(self) -> DbResult<TableSchema> {
        match self {
            Self::Table(table) => Ok(table),
            other => Err(unexpected("table schema", &other)),
        }
    }

    pub fn into_rows(self) -> DbResult<RawResultSet> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(unexpected("rows", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &OperationOutput) -> DbError {
    DbError::internal(format!("expected {expected} output, got {got:?}"))
}

/// Dispatch an [`Operation`] to the adapter.
pub async fn perform<A: DialectAdapter>(
    adapter: &A,
    conn: &mut A::Connection,
    operation: Operation,
) -> DbResult<OperationOutput> {
    match operation {
        Operation::ServerVersion => adapter.server_version(conn).await.map(OperationOutput::Version),
        Operation::ListSchemas => adapter.list_schemas(conn).await.map(OperationOutput::Names),
        Operation::ListTables { schema } => adapter
            .list_tables(conn, schema.as_deref())
            .await
            .map(OperationOutput::Names),
        Operation::DescribeTable { table, schema } => adapter
            .describe_table(conn, &table, schema.as_deref())
            .await
            .map(OperationOutput::Table),
        Operation::Execute {
            sql,
            params,
            fetch_limit,
        } => adapter
            .execute(conn, &sql, &params, fetch_limit)
            .await
            .map(OperationOutput::Rows),
    }
}

/// Connection error for a failed `open`, with a remediation hint.
pub(crate) fn open_failed(backend: BackendType, error: &dyn std::fmt::Display) -> DbError {
    let message = error.to_string();
    DbError::connection(&message, connection_suggestion(backend, &message))
}

fn connection_suggestion(backend: BackendType, error: &str) -> String {
    let error_str = error.to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {backend} server is running and accessible");
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password for this backend".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match backend {
        BackendType::Postgres => {
            "Verify DB_<NAME>_HOST/PORT/DATABASE or the postgres:// connection string".to_string()
        }
        BackendType::MySql => {
            "Verify DB_<NAME>_HOST/PORT/DATABASE or the mysql:// connection string".to_string()
        }
        BackendType::Sqlite => "Verify the file path exists and is accessible".to_string(),
        BackendType::Db2 => {
            "Verify the DB2 ODBC driver is installed and the HOSTNAME/PORT/DATABASE settings"
                .to_string()
        }
    }
}

/// Quote an identifier with `quote`, doubling embedded quote characters.
pub fn quote_identifier(ident: &str, quote: char) -> String {
    let escaped = ident.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

/// `schema.table` or `table`, each part quoted.
pub fn qualified_name(table: &str, schema: Option<&str>, quote: char) -> String {
    match schema {
        Some(schema) => format!(
            "{}.{}",
            quote_identifier(schema, quote),
            quote_identifier(table, quote)
        ),
        None => quote_identifier(table, quote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("users", '"'), "\"users\"");
        assert_eq!(quote_identifier("we\"ird", '"'), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("a`b", '`'), "`a``b`");
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("t", Some("public"), '"'), "\"public\".\"t\"");
        assert_eq!(qualified_name("t", None, '`'), "`t`");
    }

    #[test]
    fn test_open_failed_suggestion() {
        let err = open_failed(BackendType::MySql, &"Connection refused (os error 111)");
        assert_eq!(
            err.suggestion(),
            Some("Check that the MySQL server is running and accessible")
        );
        let err = open_failed(BackendType::Postgres, &"password authentication failed");
        assert_eq!(
            err.suggestion(),
            Some("Verify the username and password for this backend")
        );
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::ListSchemas.name(), "list_schemas");
        let op = Operation::Execute {
            sql: "SELECT 1".into(),
            params: vec![],
            fetch_limit: 2,
        };
        assert_eq!(op.name(), "execute_query");
    }
}
