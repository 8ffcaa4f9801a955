//! Database abstraction layer.
//!
//! - `adapter`: the per-dialect contract and the operations it serves
//! - `postgres`, `mysql`, `sqlite`, `db2`: one adapter per backend type
//! - `pool`: bounded, health-checked connection pools
//! - `registry`: named backends, each behind its own pool
//! - `executor`, `schema`: the query and introspection paths
//! - `types`, `normalize`: native values to backend-independent results

pub mod adapter;
#[cfg(feature = "db2")]
pub mod db2;
pub mod executor;
pub mod mysql;
pub mod normalize;
pub mod pool;
pub mod postgres;
pub mod registry;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use adapter::{DialectAdapter, Operation, OperationOutput, PlaceholderStyle};
pub use executor::QueryExecutor;
pub use pool::{BackendPool, ConnectionState, PooledConnection};
pub use registry::{Backend, BackendRegistry};
pub use schema::SchemaInspector;
