//! Transport layer for the MCP server.
//!
//! Only stdio is provided; it is the standard mode for CLI-based MCP clients.

pub mod stdio;

pub use stdio::StdioTransport;

use std::future::Future;

use crate::error::DbResult;

/// Trait for MCP transport implementations.
pub trait Transport: Send + Sync {
    /// Serve requests until the client disconnects or a shutdown signal arrives.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
