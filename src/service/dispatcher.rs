//! Stored procedure dispatch.
//!
//! A call names a logical service, not a connection. The dispatcher resolves
//! the service for the requested environment, asks the authorizer whether the
//! caller may run the procedure, executes it through the connection manager
//! and projects each result row onto the requested fields.
//!
//! Procedure names are untrusted input: they are validated as identifiers and
//! checked against the policy before any statement is built.

use super::registry::ServiceRegistry;
use crate::db::{ConnectionManager, validate_identifier};
use crate::error::{DbError, DbResult};
use crate::models::{
    BatchItemResult, BatchOutcome, CallerContext, Environment, ProcedureCallRequest,
    ProcedureOptions, ProcedureParams, Row, ServiceBinding,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Decides whether a caller may invoke a procedure on a service.
#[async_trait]
pub trait ProcedureAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        caller: &CallerContext,
        binding: &ServiceBinding,
        procedure: &str,
    ) -> bool;
}

/// Authorizes against the binding's own [`AccessPolicy`](crate::models::AccessPolicy).
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyAuthorizer;

#[async_trait]
impl ProcedureAuthorizer for PolicyAuthorizer {
    async fn authorize(
        &self,
        caller: &CallerContext,
        binding: &ServiceBinding,
        procedure: &str,
    ) -> bool {
        binding.policy.allows(&caller.caller_class, procedure)
    }
}

#[derive(Clone)]
pub struct ProcedureDispatcher {
    registry: Arc<ServiceRegistry>,
    manager: ConnectionManager,
    authorizer: Arc<dyn ProcedureAuthorizer>,
    default_environment: Environment,
    options: ProcedureOptions,
}

impl ProcedureDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, manager: ConnectionManager) -> Self {
        Self {
            registry,
            manager,
            authorizer: Arc::new(PolicyAuthorizer),
            default_environment: Environment::Production,
            options: ProcedureOptions::default(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn ProcedureAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Environment used when a request does not name one.
    pub fn with_default_environment(mut self, environment: Environment) -> Self {
        self.default_environment = environment;
        self
    }

    pub fn with_procedure_options(mut self, options: ProcedureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run one procedure call and return its projected rows.
    pub async fn call(
        &self,
        caller: &CallerContext,
        request: &ProcedureCallRequest,
    ) -> DbResult<Vec<Row>> {
        let started = Instant::now();
        let binding = self
            .resolve_service(&request.service, request.environment.as_deref())
            .await?;
        let environment = binding.environment;

        validate_identifier("procedure", &request.procedure)?;
        if !self
            .authorizer
            .authorize(caller, &binding, &request.procedure)
            .await
        {
            warn!(
                service = %request.service,
                procedure = %request.procedure,
                caller_class = %caller.caller_class,
                "Procedure call denied"
            );
            return Err(DbError::not_found_or_denied(format!(
                "Procedure '{}' is not available on service '{}'",
                request.procedure, request.service
            )));
        }

        let params = ProcedureParams::from_json_map(&request.params);
        debug!(
            service = %request.service,
            procedure = %request.procedure,
            environment = %environment,
            params = params.len(),
            "Dispatching procedure call"
        );
        let rows = self
            .manager
            .execute_procedure(&binding.connection, &request.procedure, &params, &self.options)
            .await
            .map_err(|e| e.into_procedure_error(&request.procedure))?;

        let fields = request
            .select
            .as_deref()
            .or(caller.requested_fields.as_deref());
        let rows = project_rows(rows, fields);

        info!(
            service = %request.service,
            procedure = %request.procedure,
            environment = %environment,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Procedure call completed"
        );
        Ok(rows)
    }

    /// Run every request concurrently. Each item succeeds or fails on its own;
    /// results come back in input order.
    pub async fn call_batch(
        &self,
        caller: &CallerContext,
        requests: &[ProcedureCallRequest],
    ) -> BatchOutcome {
        let calls = requests.iter().map(|request| async move {
            let result = self.call(caller, request).await;
            if let Err(e) = &result {
                warn!(
                    service = %request.service,
                    procedure = %request.procedure,
                    error = %e,
                    "Batch item failed"
                );
            }
            BatchItemResult::from(result)
        });
        let items = join_all(calls).await;

        let outcome = BatchOutcome { items };
        info!(
            total = outcome.len(),
            failed = outcome.failed_count(),
            "Procedure batch completed"
        );
        outcome
    }

    /// Resolve `name` in `environment` (the default environment when None).
    ///
    /// The environment must be exactly "production" or "staging"; it is
    /// checked before the registry is consulted.
    pub async fn resolve_service(
        &self,
        name: &str,
        environment: Option<&str>,
    ) -> DbResult<ServiceBinding> {
        let resolved = match environment {
            Some(raw) => raw.parse::<Environment>().map_err(DbError::validation)?,
            None => self.default_environment,
        };
        if let Some(binding) = self.registry.resolve(name, resolved).await {
            return Ok(binding);
        }
        let message = match environment {
            Some(_) => format!("Service '{}' not found in {}", name, resolved),
            None => format!("Service '{}' not found", name),
        };
        Err(DbError::not_found_or_denied(message))
    }
}

impl std::fmt::Debug for ProcedureDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureDispatcher")
            .field("default_environment", &self.default_environment)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Keep only `fields` in each row, in the order given. Fields a row does not
/// have are skipped. `None` keeps rows unchanged.
pub fn project_rows(rows: Vec<Row>, fields: Option<&[String]>) -> Vec<Row> {
    let Some(fields) = fields else {
        return rows;
    };
    rows.into_iter()
        .map(|mut row| {
            fields
                .iter()
                .filter_map(|field| row.remove(field).map(|value| (field.clone(), value)))
                .collect()
        })
        .collect()
}
