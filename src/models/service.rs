//! Service bindings and procedure call models.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, Row};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Deployment environment of a service binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact match only: "production" or "staging".
impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            other => Err(format!(
                "Invalid environment '{}': must be \"production\" or \"staging\"",
                other
            )),
        }
    }
}

/// Wildcard grant: every procedure on the service.
pub const ALL_PROCEDURES: &str = "*";

/// Which procedures each caller class may invoke on one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// caller class -> lower-cased procedure names
    grants: HashMap<String, HashSet<String>>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `caller_class` to invoke `procedures` (`*` for all).
    pub fn grant<I, S>(mut self, caller_class: impl Into<String>, procedures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_grant(caller_class, procedures);
        self
    }

    pub fn add_grant<I, S>(&mut self, caller_class: impl Into<String>, procedures: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.grants
            .entry(caller_class.into())
            .or_default()
            .extend(procedures.into_iter().map(|p| p.as_ref().to_lowercase()));
    }

    /// Procedure names compare case-insensitively.
    pub fn allows(&self, caller_class: &str, procedure: &str) -> bool {
        self.grants.get(caller_class).is_some_and(|allowed| {
            allowed.contains(ALL_PROCEDURES) || allowed.contains(&procedure.to_lowercase())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// A logical service name bound to one connection in one environment.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    pub name: String,
    pub environment: Environment,
    pub connection: ConnectionConfig,
    pub policy: AccessPolicy,
    /// Catalog connection this binding depends on, if it was created from one
    pub connection_id: Option<String>,
}

impl ServiceBinding {
    pub fn new(
        name: impl Into<String>,
        environment: Environment,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            name: name.into(),
            environment,
            connection,
            policy: AccessPolicy::default(),
            connection_id: None,
        }
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

/// Public view of a binding, without credentials.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ServiceSummary {
    pub name: String,
    pub environment: Environment,
    pub db_type: crate::models::DatabaseType,
    pub connection: String,
}

impl From<&ServiceBinding> for ServiceSummary {
    fn from(binding: &ServiceBinding) -> Self {
        Self {
            name: binding.name.clone(),
            environment: binding.environment,
            db_type: binding.connection.db_type,
            connection: binding.connection.key().to_string(),
        }
    }
}

/// One stored procedure call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProcedureCallRequest {
    /// Logical service name
    pub service: String,
    /// Procedure (or function) name, optionally schema-qualified
    pub procedure: String,
    /// Named arguments, bound in the given order
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Fields to keep in each row; overrides the caller's requested fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    /// "production" or "staging"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ProcedureCallRequest {
    pub fn new(service: impl Into<String>, procedure: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            procedure: procedure.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

/// Who is calling, and which fields their query shape asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_class: String,
    /// Fields requested by the caller; None means every field
    pub requested_fields: Option<Vec<String>>,
}

impl CallerContext {
    pub fn new(caller_class: impl Into<String>) -> Self {
        Self {
            caller_class: caller_class.into(),
            requested_fields: None,
        }
    }

    pub fn with_requested_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchItemResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Vendor error code, when one is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl BatchItemResult {
    pub fn ok(rows: Vec<Row>) -> Self {
        Self {
            success: true,
            data: Some(rows),
            error: None,
            code: None,
        }
    }

    pub fn failed(err: &DbError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: err.code().map(String::from),
        }
    }
}

impl From<DbResult<Vec<Row>>> for BatchItemResult {
    fn from(result: DbResult<Vec<Row>>) -> Self {
        match result {
            Ok(rows) => Self::ok(rows),
            Err(e) => Self::failed(&e),
        }
    }
}

/// All item results of a batch, in input order.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BatchOutcome {
    pub items: Vec<BatchItemResult>,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|i| !i.success).count()
    }

    /// Strict view: every item's rows, or `PartialBatchFailure` if any item failed.
    pub fn into_result(self) -> DbResult<Vec<Vec<Row>>> {
        let failed = self.failed_count();
        if failed > 0 {
            return Err(DbError::PartialBatchFailure {
                failed,
                total: self.items.len(),
            });
        }
        Ok(self
            .items
            .into_iter()
            .map(|i| i.data.unwrap_or_default())
            .collect())
    }
}
