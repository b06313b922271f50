//! Database Gateway - Main entry point.

use clap::Parser;
use db_gateway::config::{Config, TransportMode};
use db_gateway::credentials::CredentialCodec;
use db_gateway::db::ConnectionManager;
use db_gateway::drivers::{DriverContext, DriverFactory, VendorDriverFactory};
use db_gateway::mcp::GatewayService;
use db_gateway::models::{CallerContext, ProcedureOptions, ServiceBinding};
use db_gateway::service::{DatabaseService, ProcedureDispatcher, ServiceRegistry};
use db_gateway::transport::{HttpTransport, StdioTransport, Transport};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber. Logs go to stderr; stdout belongs to
/// the stdio transport.
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
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    if config.services.is_empty() {
        eprintln!("Error: At least one service must be configured.");
        eprintln!();
        eprintln!("Usage: db-gateway --service <name>[@<environment>]=<url> [--grant <grant>]");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  db-gateway --service local=sqlite:data.db --grant 'local:admin=*'");
        eprintln!("  db-gateway --service shop=mysql://app:pw@db:3306/shop \\");
        eprintln!("             --service shop@staging=mysql://app:pw@db-staging:3306/shop \\");
        eprintln!("             --grant 'shop:admin=get_orders|get_customer'");
        eprintln!("  db-gateway --service erp=mssql://sa:pw@sql01/erp?trust_server_certificate=true");
        std::process::exit(1);
    }

    info!(
        transport = %config.transport,
        "Starting Database Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let default_environment = config.default_environment()?;
    let codec = Arc::new(CredentialCodec::from_passphrase(
        config.credential_key.as_deref(),
    )?);
    if !codec.has_key() {
        warn!("No credential key configured; service passwords are kept in plaintext");
    }

    let context = DriverContext::new(Arc::clone(&codec))
        .with_connect_timeout(config.connect_timeout_duration())
        .with_query_timeout(config.query_timeout_duration());
    let factory: Arc<dyn DriverFactory> = Arc::new(VendorDriverFactory::new(context));
    let manager = ConnectionManager::new(Arc::clone(&factory), config.connect_timeout_duration());

    let registry = Arc::new(ServiceRegistry::new());
    for spec in config.parse_services()? {
        let mut connection = spec.connection;
        connection.validate()?;
        connection.password = codec.seal(connection.password)?;
        let environment = spec.environment.unwrap_or(default_environment);
        registry
            .register(ServiceBinding::new(spec.name, environment, connection))
            .await;
    }
    for grant in config.parse_grants()? {
        registry
            .grant(&grant.service, &grant.caller_class, &grant.procedures)
            .await?;
    }
    let services = registry.len().await;
    info!(services, "Services registered");

    let dispatcher = ProcedureDispatcher::new(Arc::clone(&registry), manager.clone())
        .with_default_environment(default_environment)
        .with_procedure_options(ProcedureOptions {
            legacy_null_as_empty: config.legacy_null_as_empty,
        });
    let database = DatabaseService::new(
        manager.clone(),
        factory,
        config.introspection_cache_ttl_duration(),
    );
    let service = GatewayService::new(
        dispatcher,
        database,
        CallerContext::new(config.caller_class.clone()),
    );

    let result = match config.transport {
        TransportMode::Stdio => {
            info!("Using stdio transport");
            StdioTransport::new(service, manager).run().await
        }
        TransportMode::Http => {
            info!(
                host = %config.http_host,
                port = config.http_port,
                endpoint = %config.mcp_endpoint,
                "Using HTTP transport"
            );
            HttpTransport::new(
                service,
                manager,
                &config.http_host,
                config.http_port,
                &config.mcp_endpoint,
            )
            .run()
            .await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
