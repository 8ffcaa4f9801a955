//! Schema introspection.
//!
//! [`SchemaInspector`] is stateless: each call borrows a handle from the
//! backend's pool, runs the adapter's catalog query and shapes the answer.
//! Capability gaps surface as `UnsupportedOperation` rather than empty lists.

use tracing::debug;

use crate::db::adapter::Operation;
use crate::db::registry::Backend;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionStatus, SchemaList, TableList, TableSchema};

/// Schema inspector for database introspection.
pub struct SchemaInspector;

impl SchemaInspector {
    /// Open (or reuse) a connection and report the server version.
    ///
    /// Connection failures and pool exhaustion are reported as
    /// `connected: false` rather than as errors.
    pub async fn test_connection(backend: &dyn Backend) -> DbResult<ConnectionStatus> {
        let descriptor = backend.descriptor();
        let mut status = ConnectionStatus {
            backend: descriptor.name.clone(),
            backend_type: descriptor.backend_type,
            connected: false,
            read_only: descriptor.read_only,
            version: None,
            message: None,
        };

        match backend.run(Operation::ServerVersion).await {
            Ok(output) => {
                status.version = Some(output.into_version()?);
                status.connected = true;
            }
            Err(e @ (DbError::Connection { .. } | DbError::PoolExhausted { .. })) => {
                debug!(backend = %descriptor.name, error = %e, "Connection test failed");
                status.message = Some(e.user_message());
            }
            Err(e) => return Err(e),
        }
        Ok(status)
    }

    pub async fn list_schemas(backend: &dyn Backend) -> DbResult<SchemaList> {
        let schemas = backend.run(Operation::ListSchemas).await?.into_names()?;
        Ok(SchemaList {
            backend: backend.name().to_string(),
            count: schemas.len(),
            schemas,
        })
    }

    pub async fn list_tables(backend: &dyn Backend, schema: Option<&str>) -> DbResult<TableList> {
        let tables = backend
            .run(Operation::ListTables {
                schema: schema.map(str::to_string),
            })
            .await?
            .into_names()?;
        Ok(TableList {
            backend: backend.name().to_string(),
            schema: schema.map(str::to_string),
            count: tables.len(),
            tables,
        })
    }

    /// Describe a table's columns, ordered by their position in the definition.
    pub async fn describe_table(
        backend: &dyn Backend,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        if table.trim().is_empty() {
            return Err(DbError::validation("Table name is empty"));
        }
        let mut described = backend
            .run(Operation::DescribeTable {
                table: table.to_string(),
                schema: schema.map(str::to_string),
            })
            .await?
            .into_table()?;
        described.columns.sort_by_key(|c| c.ordinal_position);
        debug!(
            backend = %backend.name(),
            table = %described.qualified_name(),
            columns = described.columns.len(),
            "Described table"
        );
        Ok(described)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::registry::BackendRegistry;
    use crate::error::ErrorKind;
    use crate::models::ConnectionDescriptor;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry
            .register(
                ConnectionDescriptor::sqlite("local", dir.path().join("s.db")).with_read_only(false),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_connection_reports_version() {
        let dir = TempDir::new().unwrap();
        let backend = registry(&dir).get("local").unwrap();

        let status = SchemaInspector::test_connection(backend.as_ref()).await.unwrap();
        assert!(status.connected);
        assert!(status.version.unwrap().starts_with("SQLite "));
        assert!(!status.read_only);
    }

    #[tokio::test]
    async fn test_connection_failure_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mut registry = BackendRegistry::new();
        // Read-only open of a file that does not exist.
        registry
            .register(ConnectionDescriptor::sqlite("missing", dir.path().join("nope/x.db")))
            .unwrap();
        let backend = registry.get("missing").unwrap();

        let status = SchemaInspector::test_connection(backend.as_ref()).await.unwrap();
        assert!(!status.connected);
        assert!(status.message.is_some());
    }

    #[tokio::test]
    async fn test_list_schemas_unsupported_on_sqlite() {
        let dir = TempDir::new().unwrap();
        let backend = registry(&dir).get("local").unwrap();

        let err = SchemaInspector::list_schemas(backend.as_ref()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("'local'"));
    }

    #[tokio::test]
    async fn test_describe_missing_table() {
        let dir = TempDir::new().unwrap();
        let backend = registry(&dir).get("local").unwrap();

        let err = SchemaInspector::describe_table(backend.as_ref(), "ghost", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
