//! MCP service implementation using rmcp.
//!
//! `GatewayService` exposes the gateway as MCP tools: service discovery,
//! connection probes, schema introspection and stored procedure calls. Every
//! call runs as the caller class the gateway was started with.

use crate::models::{
    BatchOutcome, CallerContext, ColumnDescriptor, ConnectionTestResult,
    DatabaseObjectDescriptor, ObjectCategory, ProcedureCallRequest, Row, ServiceBinding,
    ServiceSummary,
};
use crate::service::{DatabaseService, ProcedureDispatcher, ServiceRegistry};
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    schemars::JsonSchema,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Output for the list_services tool.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ListServicesOutput {
    /// Registered services, one entry per environment
    pub services: Vec<ServiceSummary>,
    pub count: usize,
}

/// Identifies one service binding.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ServiceInput {
    /// Service name from list_services
    pub service: String,
    /// "production" or "staging"; defaults to the gateway's default environment
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListDatabasesOutput {
    pub databases: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListObjectsInput {
    pub service: String,
    #[serde(default)]
    pub environment: Option<String>,
    /// Database (or schema, for SQLite attachments) to inspect; defaults to the service's database
    #[serde(default)]
    pub database: Option<String>,
    /// Only objects of this category
    #[serde(default)]
    pub category: Option<ObjectCategory>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListObjectsOutput {
    pub objects: Vec<DatabaseObjectDescriptor>,
    pub count: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TableColumnsInput {
    pub service: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Table name, optionally schema-qualified ("sales.orders")
    pub table: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct TableColumnsOutput {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ProcedureOutput {
    pub rows: Vec<Row>,
    pub count: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProceduresInput {
    /// Calls to run; results come back in the same order
    pub requests: Vec<ProcedureCallRequest>,
}

#[derive(Clone)]
pub struct GatewayService {
    dispatcher: ProcedureDispatcher,
    database: DatabaseService,
    caller: CallerContext,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
}

impl GatewayService {
    pub fn new(
        dispatcher: ProcedureDispatcher,
        database: DatabaseService,
        caller: CallerContext,
    ) -> Self {
        Self {
            dispatcher,
            database,
            caller,
            tool_router: Self::tool_router(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.dispatcher.registry()
    }

    /// Resolve a service, requiring a non-empty name.
    async fn binding(
        &self,
        service: &str,
        environment: Option<&str>,
    ) -> Result<ServiceBinding, McpError> {
        let service = service.trim();
        if service.is_empty() {
            return Err(McpError::invalid_params(
                "service is required. Call list_services first to get available service names.",
                None,
            ));
        }
        Ok(self
            .dispatcher
            .resolve_service(service, environment)
            .await?)
    }
}

#[tool_router]
impl GatewayService {
    #[tool(
        description = "List all registered services.\nReturns service names, environments (production/staging), database types and connection signatures."
    )]
    async fn list_services(&self) -> Json<ListServicesOutput> {
        let services = self.registry().list().await;
        let count = services.len();
        Json(ListServicesOutput { services, count })
    }

    #[tool(
        description = "Probe the connection behind a service with a short-lived pool.\nAlways returns a result: success=false carries the error and vendor code."
    )]
    async fn test_connection(
        &self,
        Parameters(input): Parameters<ServiceInput>,
    ) -> Result<Json<ConnectionTestResult>, McpError> {
        let binding = self
            .binding(&input.service, input.environment.as_deref())
            .await?;
        Ok(Json(self.database.test_connection(&binding.connection).await))
    }

    #[tool(description = "List the databases on the server behind a service.")]
    async fn list_databases(
        &self,
        Parameters(input): Parameters<ServiceInput>,
    ) -> Result<Json<ListDatabasesOutput>, McpError> {
        let binding = self
            .binding(&input.service, input.environment.as_deref())
            .await?;
        let databases = self
            .database
            .get_database_list(&binding.connection)
            .await?;
        let count = databases.len();
        Ok(Json(ListDatabasesOutput { databases, count }))
    }

    #[tool(
        description = "List tables, views, procedures and functions of a service's database.\nSystem schemas are excluded. Filter with category: TABLE, VIEW, PROCEDURE or FUNCTION."
    )]
    async fn list_objects(
        &self,
        Parameters(input): Parameters<ListObjectsInput>,
    ) -> Result<Json<ListObjectsOutput>, McpError> {
        let binding = self
            .binding(&input.service, input.environment.as_deref())
            .await?;
        let mut objects = self
            .database
            .get_database_objects(&binding.connection, input.database.as_deref())
            .await?;
        if let Some(category) = input.category {
            objects.retain(|o| o.category == category);
        }
        let count = objects.len();
        Ok(Json(ListObjectsOutput { objects, count }))
    }

    #[tool(
        description = "Describe the columns of a table: type, nullability, length, precision, default and position."
    )]
    async fn get_table_columns(
        &self,
        Parameters(input): Parameters<TableColumnsInput>,
    ) -> Result<Json<TableColumnsOutput>, McpError> {
        let binding = self
            .binding(&input.service, input.environment.as_deref())
            .await?;
        let columns = self
            .database
            .get_table_columns(&binding.connection, input.database.as_deref(), &input.table)
            .await?;
        Ok(Json(TableColumnsOutput {
            table: input.table,
            columns,
        }))
    }

    #[tool(
        description = "Call a stored procedure on a service.\nParameters are bound by name in the given order. Use select to keep only some fields of each row.\nThe caller must be granted the procedure on that service."
    )]
    async fn procedure(
        &self,
        Parameters(request): Parameters<ProcedureCallRequest>,
    ) -> Result<Json<ProcedureOutput>, McpError> {
        let rows = self
            .dispatcher
            .call(&self.caller, &request)
            .await?;
        let count = rows.len();
        Ok(Json(ProcedureOutput { rows, count }))
    }

    #[tool(
        description = "Call several stored procedures concurrently.\nEach item succeeds or fails on its own; results keep the request order."
    )]
    async fn procedures(
        &self,
        Parameters(input): Parameters<ProceduresInput>,
    ) -> Json<BatchOutcome> {
        Json(
            self.dispatcher
                .call_batch(&self.caller, &input.requests)
                .await,
        )
    }
}

#[tool_handler]
impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "db-gateway".to_owned(),
                title: Some("Database Gateway".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Pooled access to MySQL, PostgreSQL, SQL Server and SQLite through named services.\n\
                \n\
                ## Workflow\n\
                1. Call `list_services` to get service names and environments\n\
                2. Explore with `list_databases`, `list_objects` and `get_table_columns`\n\
                3. Run stored procedures with `procedure`, or several at once with `procedures`\n\
                \n\
                ## Environments\n\
                `environment` must be exactly \"production\" or \"staging\". When omitted the\n\
                gateway's default environment is used.\n\
                \n\
                ## Procedures\n\
                - Only procedures granted to this gateway's caller class can be called\n\
                - `select` keeps only the listed fields; unknown fields are ignored\n\
                - A failing item in `procedures` does not affect the others"
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConnectionManager;
    use crate::drivers::{DriverContext, DriverFactory, VendorDriverFactory};
    use crate::models::{ConnectionConfig, Environment};
    use std::time::Duration;

    fn create_test_service() -> GatewayService {
        let factory: Arc<dyn DriverFactory> =
            Arc::new(VendorDriverFactory::new(DriverContext::default()));
        let manager = ConnectionManager::new(Arc::clone(&factory), Duration::from_secs(5));
        let database = DatabaseService::new(manager.clone(), factory, Duration::ZERO);
        let dispatcher = ProcedureDispatcher::new(Arc::new(ServiceRegistry::new()), manager);
        GatewayService::new(dispatcher, database, CallerContext::new("admin"))
    }

    #[tokio::test]
    async fn test_binding_rejects_empty_service() {
        let service = create_test_service();
        let err = service.binding("   ", None).await.unwrap_err();
        assert!(err.to_string().contains("service is required"));
    }

    #[tokio::test]
    async fn test_binding_resolves_registered_service() {
        let service = create_test_service();
        service
            .registry()
            .register(ServiceBinding::new(
                "local",
                Environment::Staging,
                ConnectionConfig::sqlite(":memory:"),
            ))
            .await;

        assert!(service.binding(" local ", Some("staging")).await.is_ok());
        assert!(service.binding("local", None).await.is_err());
        assert!(service.binding("local", Some("STAGING")).await.is_err());
    }

    #[test]
    fn test_server_info() {
        let service = create_test_service();
        let info = service.get_info();
        assert_eq!(info.server_info.name, "db-gateway");
        assert!(info.capabilities.tools.is_some());
    }
}
