//! Error types for the multi-backend database core.
//!
//! Every failure a caller can see maps to one [`ErrorKind`], so the dispatch
//! layer can tell "this backend is down" apart from "you are not allowed to run
//! this query" and "no capacity right now".

use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error for backend '{backend}': {message}")]
    Configuration { backend: String, message: String },

    #[error("Connection to backend '{backend}' failed: {message}")]
    Connection {
        backend: String,
        message: String,
        suggestion: String,
    },

    #[error("No connection available for backend '{backend}' within {waited_ms}ms")]
    PoolExhausted { backend: String, waited_ms: u64 },

    #[error("Query rejected: {message}")]
    QueryValidation {
        message: String,
        /// Statement keyword that triggered the rejection, uppercased.
        keyword: Option<String>,
    },

    #[error("{operation} failed on backend '{backend}': {message}")]
    QueryExecution {
        backend: String,
        operation: String,
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Operation '{operation}' is not supported by backend '{backend}'")]
    UnsupportedOperation { backend: String, operation: String },

    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable, serializable category of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    ConnectionError,
    PoolExhausted,
    QueryValidationError,
    QueryExecutionError,
    UnsupportedOperation,
    NotFound,
    InternalError,
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    ///
    /// The backend name may be left empty; the pool fills it in.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            backend: String::new(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_exhausted(backend: impl Into<String>, waited: Duration) -> Self {
        Self::PoolExhausted {
            backend: backend.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::QueryValidation {
            message: message.into(),
            keyword: None,
        }
    }

    /// Create a validation error naming the offending keyword.
    pub fn rejected_keyword(keyword: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueryValidation {
            message: message.into(),
            keyword: Some(keyword.into()),
        }
    }

    /// Create an execution error for `operation`.
    pub fn execution(
        operation: impl Into<String>,
        message: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::QueryExecution {
            backend: String::new(),
            operation: operation.into(),
            message: message.into(),
            sql_state,
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    pub fn backend_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Backend",
            name: name.into(),
        }
    }

    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Table",
            name: name.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a driver error raised while performing `operation`.
    ///
    /// I/O, TLS and protocol failures become [`DbError::Connection`], which marks
    /// the borrowed handle as broken.
    pub fn driver(err: sqlx::Error, operation: &str) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::execution(operation, db_err.message(), code)
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {io_err}"),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {tls_err}"),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {msg}"),
                "Check database server compatibility",
            ),
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => DbError::connection(
                "Database connection worker stopped",
                "Retry the request; a new connection will be opened",
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::execution(
                operation,
                format!("Failed to decode column {index}: {source}"),
                None,
            ),
            other => DbError::execution(operation, other.to_string(), None),
        }
    }

    /// Attach the backend name to errors raised below the pool boundary.
    pub fn with_backend(mut self, name: &str) -> Self {
        match &mut self {
            Self::Connection { backend, .. }
            | Self::QueryExecution { backend, .. }
            | Self::UnsupportedOperation { backend, .. }
                if backend.is_empty() =>
            {
                *backend = name.to_string();
            }
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::ConfigurationError,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::QueryValidation { .. } => ErrorKind::QueryValidationError,
            Self::QueryExecution { .. } => ErrorKind::QueryExecutionError,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("All connections are busy; retry shortly or raise the pool size")
            }
            _ => None,
        }
    }

    /// Connection-level failures leave the handle unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted { .. })
    }

    /// Render the message returned to callers.
    ///
    /// Includes the SQLSTATE for execution errors and the suggestion when one exists.
    pub fn user_message(&self) -> String {
        let mut message = match self {
            Self::QueryExecution {
                sql_state: Some(code),
                ..
            } => format!("{self} (SQLSTATE: {code})"),
            _ => self.to_string(),
        };
        if let Some(suggestion) = self.suggestion() {
            message.push_str(". ");
            message.push_str(suggestion);
        }
        message
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
