//! Multi-database MCP server library.
//!
//! Exposes PostgreSQL, MySQL, SQLite and DB2 backends to AI assistants through
//! a uniform set of MCP tools, with read-only enforcement, bounded connection
//! pools and JSON-safe result normalization.

pub mod config;
pub mod db;
pub mod error;
pub mod mcp;
pub mod models;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::DbError;
pub use mcp::DbService;
