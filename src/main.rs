//! Multi-database MCP server - main entry point.
//!
//! Loads backend descriptors from the environment and CLI, registers a pool per
//! backend and serves MCP over stdio.

use std::sync::Arc;

use clap::Parser;
use multidb_mcp_server::config::{Config, ConfigError};
use multidb_mcp_server::db::{BackendRegistry, QueryExecutor};
use multidb_mcp_server::transport::{StdioTransport, Transport};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber. stdout carries the protocol, so logs go to stderr.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting multidb MCP server v{}", env!("CARGO_PKG_VERSION"));

    let (descriptors, config_errors) = config.load_backends(std::env::vars());
    for e in &config_errors {
        warn!(error = %e, "Skipping misconfigured backend");
    }

    let mut registry = BackendRegistry::new();
    let failures = registry.register_all(descriptors);
    if registry.is_empty() {
        error!(
            config_errors = config_errors.len(),
            registration_errors = failures.len(),
            "No usable backend"
        );
        return Err(ConfigError::NoBackends.into());
    }
    info!(backends = ?registry.names(), "Backends ready");

    let transport = StdioTransport::new(
        Arc::new(registry),
        QueryExecutor::new(config.query_policy()),
    );
    if let Err(e) = transport.run().await {
        error!(error = %e, transport = transport.name(), "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
