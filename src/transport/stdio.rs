//! Stdio transport for the MCP server.
//!
//! JSON-RPC messages are read from stdin and responses written to stdout, so
//! logs must go to stderr.

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tokio::signal;
use tracing::{info, warn};

use crate::db::{BackendRegistry, QueryExecutor};
use crate::error::{DbError, DbResult};
use crate::mcp::DbService;
use crate::transport::Transport;

pub struct StdioTransport {
    registry: Arc<BackendRegistry>,
    executor: QueryExecutor,
}

impl StdioTransport {
    pub fn new(registry: Arc<BackendRegistry>, executor: QueryExecutor) -> Self {
        Self { registry, executor }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!(backends = self.registry.len(), "Starting MCP server with stdio transport");

        let service = DbService::new(Arc::clone(&self.registry), self.executor.clone());
        let running_service = service
            .serve(stdio())
            .await
            .map_err(|e| DbError::internal(format!("Failed to start stdio transport: {e}")))?;

        let (shutdown_requested, outcome) = tokio::select! {
            result = running_service.waiting() => match result {
                Ok(reason) => {
                    info!(?reason, "Client disconnected");
                    (false, Ok(()))
                }
                Err(e) => {
                    warn!(error = %e, "Stdio transport error");
                    (false, Err(DbError::internal(format!("Stdio transport error: {e}"))))
                }
            },
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                (true, Ok(()))
            }
        };

        if shutdown_requested {
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        // Waits for in-flight operations before closing pooled connections.
        info!("Shutting down backend pools");
        self.registry.shutdown().await;

        if shutdown_requested {
            // stdin reads cannot be interrupted by select!
            info!("Exiting process");
            std::process::exit(0);
        }

        outcome
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed never fires.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
