//! Data models shared across the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    BackendSummary, BackendType, ConnectionDescriptor, ConnectionDescriptorError,
    ConnectionTarget, Credentials, PoolStatus, SslMode, SslOptions,
};
pub use query::{
    ColumnInfo, DEFAULT_ROW_LIMIT, DEFAULT_SAMPLE_LIMIT, MAX_ROW_LIMIT, MAX_SAMPLE_LIMIT,
    QueryParam, QueryRequest, QueryResult, ScalarValue,
};
pub use schema::{ColumnDefinition, ConnectionStatus, SchemaList, TableList, TableSchema};
