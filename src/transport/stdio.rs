//! Stdio transport for the MCP server.
//!
//! JSON-RPC messages are read from stdin and responses written to stdout, so
//! logging must go to stderr while this transport runs.

use super::{Transport, wait_for_signal};
use crate::db::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::mcp::GatewayService;
use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};

pub struct StdioTransport {
    service: GatewayService,
    manager: ConnectionManager,
}

impl StdioTransport {
    /// `manager` is the one backing `service`; its pools are closed on shutdown.
    pub fn new(service: GatewayService, manager: ConnectionManager) -> Self {
        Self { service, manager }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Starting MCP server with stdio transport");

        let running_service = self
            .service
            .clone()
            .serve(stdio())
            .await
            .map_err(|e| DbError::internal(format!("Failed to start stdio transport: {}", e)))?;

        let shutdown_requested = tokio::select! {
            result = running_service.waiting() => {
                match result {
                    Ok(_quit_reason) => info!("Stdio transport completed normally"),
                    Err(e) => {
                        warn!(error = %e, "Stdio transport error");
                        self.manager.close_all_connections().await;
                        return Err(DbError::internal(format!("Stdio transport error: {}", e)));
                    }
                }
                false
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received (send again to force exit)");
                true
            }
        };

        if shutdown_requested {
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        }

        let pools = self.manager.connection_count().await;
        info!(pools, "Closing all database connections");
        self.manager.close_all_connections().await;

        if shutdown_requested {
            // stdin reads block and cannot be interrupted by select!
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{DriverContext, DriverFactory, VendorDriverFactory};
    use crate::models::CallerContext;
    use crate::service::{DatabaseService, ProcedureDispatcher, ServiceRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stdio_transport_creation() {
        let factory: Arc<dyn DriverFactory> =
            Arc::new(VendorDriverFactory::new(DriverContext::default()));
        let manager = ConnectionManager::new(Arc::clone(&factory), Duration::from_secs(5));
        let service = GatewayService::new(
            ProcedureDispatcher::new(Arc::new(ServiceRegistry::new()), manager.clone()),
            DatabaseService::new(manager.clone(), factory, Duration::ZERO),
            CallerContext::new("admin"),
        );
        let transport = StdioTransport::new(service, manager);
        assert_eq!(transport.name(), "stdio");
    }
}
