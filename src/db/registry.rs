//! Named backends and their pools.
//!
//! The registry is an explicit value owned by the caller; there is no global
//! state, so independent registries can coexist (e.g., one per test).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::db::adapter::{DialectAdapter, Operation, OperationOutput, PlaceholderStyle};
use crate::db::mysql::MySqlAdapter;
use crate::db::pool::BackendPool;
use crate::db::postgres::PostgresAdapter;
use crate::db::sqlite::SqliteAdapter;
use crate::error::{DbError, DbResult};
use crate::models::{BackendSummary, BackendType, ConnectionDescriptor, PoolStatus};

/// Type-erased view of one configured backend.
#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &ConnectionDescriptor;

    fn placeholder_style(&self) -> PlaceholderStyle;

    fn sample_query(&self, table: &str, schema: Option<&str>, limit: u32) -> DbResult<String>;

    async fn run(&self, operation: Operation) -> DbResult<OperationOutput>;

    fn status(&self) -> PoolStatus;

    async fn shutdown(&self);

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn backend_type(&self) -> BackendType {
        self.descriptor().backend_type
    }

    fn summary(&self) -> BackendSummary {
        let descriptor = self.descriptor();
        BackendSummary {
            name: descriptor.name.clone(),
            backend_type: descriptor.backend_type,
            read_only: descriptor.read_only,
            pool_size: descriptor.effective_pool_size(),
            target: descriptor.masked_target(),
            pool: self.status(),
        }
    }
}

#[async_trait]
impl<A: DialectAdapter> Backend for BackendPool<A> {
    fn descriptor(&self) -> &ConnectionDescriptor {
        BackendPool::descriptor(self)
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        self.adapter().placeholder_style()
    }

    fn sample_query(&self, table: &str, schema: Option<&str>, limit: u32) -> DbResult<String> {
        self.adapter()
            .sample_query(table, schema, limit)
            .map_err(|e| e.with_backend(Backend::name(self)))
    }

    async fn run(&self, operation: Operation) -> DbResult<OperationOutput> {
        BackendPool::run(self, operation).await
    }

    fn status(&self) -> PoolStatus {
        BackendPool::status(self)
    }

    async fn shutdown(&self) {
        BackendPool::shutdown(self).await
    }
}

/// All configured backends, by name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `descriptor` and create its pool. No connection is opened yet.
    pub fn register(&mut self, descriptor: ConnectionDescriptor) -> DbResult<()> {
        descriptor
            .validate()
            .map_err(|e| DbError::configuration(&descriptor.name, e.to_string()))?;

        let descriptor = Arc::new(descriptor);
        let backend: Arc<dyn Backend> = match descriptor.backend_type {
            BackendType::Postgres => pool_for(PostgresAdapter, descriptor)?,
            BackendType::MySql => pool_for(MySqlAdapter, descriptor)?,
            BackendType::Sqlite => pool_for(SqliteAdapter, descriptor)?,
            #[cfg(feature = "db2")]
            BackendType::Db2 => pool_for(crate::db::db2::Db2Adapter, descriptor)?,
            #[cfg(not(feature = "db2"))]
            BackendType::Db2 => {
                return Err(DbError::configuration(
                    &descriptor.name,
                    "DB2 support is not compiled in; rebuild with the `db2` feature",
                ));
            }
        };
        self.register_backend(backend)
    }

    /// Add an already-built backend. Names must be unique.
    pub fn register_backend(&mut self, backend: Arc<dyn Backend>) -> DbResult<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(DbError::configuration(&name, "backend name is already registered"));
        }
        info!(
            backend = %name,
            backend_type = %backend.backend_type(),
            read_only = backend.descriptor().read_only,
            target = %backend.descriptor().masked_target(),
            "Registered backend"
        );
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Register every descriptor, logging and collecting failures.
    ///
    /// One bad backend does not prevent the others from registering.
    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = ConnectionDescriptor>,
    ) -> Vec<DbError> {
        let mut failures = Vec::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if let Err(e) = self.register(descriptor) {
                error!(backend = %name, error = %e, "Failed to register backend");
                failures.push(e);
            }
        }
        failures
    }

    pub fn get(&self, name: &str) -> DbResult<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::backend_not_found(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Summaries of every backend, sorted by name.
    pub fn summaries(&self) -> Vec<BackendSummary> {
        let mut summaries: Vec<_> = self.backends.values().map(|b| b.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Shut down every pool.
    pub async fn shutdown(&self) {
        for backend in self.backends.values() {
            backend.shutdown().await;
        }
    }
}

fn pool_for<A: DialectAdapter>(
    adapter: A,
    descriptor: Arc<ConnectionDescriptor>,
) -> DbResult<Arc<dyn Backend>> {
    adapter.check_descriptor(&descriptor)?;
    Ok(Arc::new(BackendPool::new(adapter, descriptor)))
}
