//! Connection-related data models.
//!
//! This module defines the vendor enum, the immutable [`ConnectionConfig`] value,
//! the password-free [`ConnectionKey`] used for pooling, and the static
//! validation rules each vendor publishes.

use crate::config::PoolOptions;
use crate::credentials::StoredCredential;
use crate::error::{DbError, DbResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    /// Microsoft SQL Server (TDS)
    MSSQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection URL scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("mssql://") || lower.starts_with("sqlserver://") {
            Some(Self::MSSQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::MSSQL => "SQL Server",
            Self::SQLite => "SQLite",
        }
    }

    /// Lowercase identifier used in keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgresql",
            Self::MySQL => "mysql",
            Self::MSSQL => "mssql",
            Self::SQLite => "sqlite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::MSSQL => Some(1433),
            Self::SQLite => None,
        }
    }

    /// Whether this vendor talks to a network server (as opposed to a local file).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::SQLite)
    }

    /// Static description of which configuration fields this vendor needs.
    pub fn connection_validation(&self) -> ConnectionValidation {
        let mut fields = Vec::new();
        if self.is_networked() {
            fields.push(FieldRule::text("host", true).max(255));
            fields.push(FieldRule::port(false));
            fields.push(FieldRule::text("username", true).max(128));
            fields.push(FieldRule::text("password", false));
            fields.push(FieldRule::text("database", false).max(128));
            fields.push(FieldRule::flag("ssl"));
        } else {
            fields.push(FieldRule::text("database", true).min(1));
        }
        if *self == Self::MSSQL {
            fields.push(FieldRule::flag("trust_server_certificate"));
        }
        ConnectionValidation {
            db_type: *self,
            default_port: self.default_port(),
            fields,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Parse a declared vendor type string ("MYSQL", "postgresql", "mssql", ...).
impl FromStr for DatabaseType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "postgresql" | "postgres" | "pg" => Ok(Self::PostgreSQL),
            "mssql" | "sqlserver" | "sql_server" => Ok(Self::MSSQL),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            _ => Err(DbError::unsupported_vendor(s)),
        }
    }
}

/// Kind of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Port,
    Flag,
}

/// One field of a vendor's validation rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct FieldRule {
    pub name: &'static str,
    pub required: bool,
    pub kind: FieldKind,
    /// Minimum length (text) or value (port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    /// Maximum length (text) or value (port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl FieldRule {
    fn text(name: &'static str, required: bool) -> Self {
        Self {
            name,
            required,
            kind: FieldKind::Text,
            min: required.then_some(1),
            max: None,
        }
    }

    fn port(required: bool) -> Self {
        Self {
            name: "port",
            required,
            kind: FieldKind::Port,
            min: Some(1),
            max: Some(u16::MAX as u32),
        }
    }

    fn flag(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            kind: FieldKind::Flag,
            min: None,
            max: None,
        }
    }

    fn min(mut self, min: u32) -> Self {
        self.min = Some(min);
        self
    }

    fn max(mut self, max: u32) -> Self {
        self.max = Some(max);
        self
    }
}

/// Static capability description returned by `connection_validation()`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ConnectionValidation {
    pub db_type: DatabaseType,
    pub default_port: Option<u16>,
    pub fields: Vec<FieldRule>,
}

impl ConnectionValidation {
    /// Check a configuration against these rules.
    pub fn check(&self, config: &ConnectionConfig) -> DbResult<()> {
        for rule in &self.fields {
            match rule.kind {
                FieldKind::Text => {
                    let value = match rule.name {
                        "host" => Some(config.host.as_str()),
                        "username" => Some(config.username.as_str()),
                        "database" => config.database.as_deref(),
                        _ => continue,
                    };
                    let len = value.map(|v| v.trim().chars().count()).unwrap_or(0) as u32;
                    if rule.required && len == 0 {
                        return Err(DbError::validation(format!(
                            "'{}' is required for {}",
                            rule.name, self.db_type
                        )));
                    }
                    if let Some(max) = rule.max {
                        if len > max {
                            return Err(DbError::validation(format!(
                                "'{}' must be at most {} characters",
                                rule.name, max
                            )));
                        }
                    }
                }
                FieldKind::Port => match config.port {
                    Some(0) => {
                        return Err(DbError::validation("'port' must be between 1 and 65535"));
                    }
                    None if rule.required => {
                        return Err(DbError::validation(format!(
                            "'port' is required for {}",
                            self.db_type
                        )));
                    }
                    _ => {}
                },
                FieldKind::Flag => {}
            }
        }
        Ok(())
    }
}

/// Configuration for a database connection. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub db_type: DatabaseType,
    #[serde(default)]
    pub host: String,
    /// None means the vendor default port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    /// Persisted credential; decrypted by the driver right before connecting
    #[serde(default)]
    pub password: StoredCredential,
    /// Target database. For SQLite this is the file path (or ":memory:").
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    /// SQL Server only: accept the server certificate without validation
    #[serde(default)]
    pub trust_server_certificate: bool,
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Create a configuration for a networked vendor.
    pub fn new(
        db_type: DatabaseType,
        host: impl Into<String>,
        port: Option<u16>,
        username: impl Into<String>,
        password: StoredCredential,
        database: Option<String>,
    ) -> Self {
        Self {
            db_type,
            host: host.into(),
            port,
            username: username.into(),
            password,
            database,
            ssl: false,
            trust_server_certificate: false,
            pool_options: PoolOptions::default(),
        }
    }

    /// Create a SQLite configuration for a file path or ":memory:".
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            db_type: DatabaseType::SQLite,
            host: String::new(),
            port: None,
            username: String::new(),
            password: StoredCredential::default(),
            database: Some(path.into()),
            ssl: false,
            trust_server_certificate: false,
            pool_options: PoolOptions::default(),
        }
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    /// Port actually used to connect.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.db_type.default_port())
    }

    /// Validate against the vendor's rules and the pool options.
    pub fn validate(&self) -> DbResult<()> {
        self.db_type.connection_validation().check(self)?;
        self.pool_options.validate().map_err(DbError::validation)
    }

    /// Canonical pooling key. The password is deliberately not part of it.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            db_type: self.db_type,
            host: self.host.trim().to_ascii_lowercase(),
            port: self.effective_port(),
            database: self.database.clone().filter(|d| !d.is_empty()),
            username: self.username.clone(),
            ssl: self.ssl,
            trust_server_certificate: self.trust_server_certificate,
        }
    }

    /// Same config pointed at another database on the same server.
    pub fn for_database(&self, database: &str) -> Self {
        let mut scoped = self.clone();
        scoped.database = Some(database.to_string());
        scoped
    }

    /// True when switching from `self` to `other` needs a fresh connection test.
    pub fn connection_affecting_change(&self, other: &ConnectionConfig) -> bool {
        self.key() != other.key() || self.password != other.password
    }
}

/// Canonical signature of a connection, used as the pool registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, JsonSchema)]
pub struct ConnectionKey {
    pub db_type: DatabaseType,
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: String,
    pub ssl: bool,
    pub trust_server_certificate: bool,
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.db_type == DatabaseType::SQLite {
            return write!(f, "sqlite:{}", self.database.as_deref().unwrap_or(""));
        }
        write!(f, "{}://{}@{}", self.db_type.as_str(), self.username, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(db) = &self.database {
            write!(f, "/{}", db)?;
        }
        Ok(())
    }
}

/// Outcome of a connection probe. Never an error: failures are data.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Vendor error code, when the failure carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub elapsed_ms: u64,
}

impl ConnectionTestResult {
    pub fn ok(server_version: Option<String>, elapsed_ms: u64) -> Self {
        let message = match &server_version {
            Some(v) => format!("Connection successful ({})", v),
            None => "Connection successful".to_string(),
        };
        Self {
            success: true,
            message: Some(message),
            error: None,
            code: None,
            server_version,
            elapsed_ms,
        }
    }

    pub fn failed(err: &DbError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(err.to_string()),
            code: err.code().map(String::from),
            server_version: None,
            elapsed_ms,
        }
    }
}
