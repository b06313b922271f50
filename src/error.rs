//! Error types for the database gateway.
//!
//! Every vendor error is translated into [`DbError`] at the driver boundary, so
//! callers only ever match on this taxonomy. Variants carry enough detail
//! (vendor codes, suggestions) for the calling layer to render a precise response.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// Malformed configuration or request, reported before any connection attempt.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Unsupported database vendor: {vendor}")]
    UnsupportedVendor { vendor: String },

    /// DNS, refused, TLS or authentication failure while connecting.
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        /// Vendor error code or SQLSTATE, e.g. "28000" or "18456"
        code: Option<String>,
        suggestion: String,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    /// Service or procedure could not be resolved, or the caller may not invoke it.
    #[error("{message}")]
    ProcedureNotFoundOrDenied { message: String },

    #[error("Procedure '{procedure}' failed: {message}")]
    ProcedureExecution {
        procedure: String,
        message: String,
        code: Option<String>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Batch completed with {failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Credential error: {message}")]
    Credential { message: String },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an unsupported vendor error.
    pub fn unsupported_vendor(vendor: impl Into<String>) -> Self {
        Self::UnsupportedVendor {
            vendor: vendor.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            code: None,
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection error carrying the vendor error code.
    pub fn connection_with_code(
        message: impl Into<String>,
        code: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            code,
            suggestion: suggestion.into(),
        }
    }

    /// Create a "not found or denied" error for service/procedure resolution.
    pub fn not_found_or_denied(message: impl Into<String>) -> Self {
        Self::ProcedureNotFoundOrDenied {
            message: message.into(),
        }
    }

    /// Create a procedure execution error.
    pub fn procedure_execution(
        procedure: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::ProcedureExecution {
            procedure: procedure.into(),
            message: message.into(),
            code,
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a credential error.
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Re-label a query-level failure as a failure of the named procedure.
    ///
    /// Connection-level errors pass through unchanged so callers can still
    /// tell "could not reach the database" apart from "the procedure raised".
    pub fn into_procedure_error(self, procedure: &str) -> Self {
        match self {
            Self::Database {
                message, sql_state, ..
            } => Self::procedure_execution(procedure, message, sql_state),
            other => other,
        }
    }

    /// Vendor error code attached to this error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. } | Self::ProcedureExecution { code, .. } => {
                code.as_deref()
            }
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolClosed => Some("Retry the request; the pool is recreated on next use"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolClosed
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::validation(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::database(
                format!("Type not found: {}", type_name),
                None,
                "Check the parameter types passed to the statement",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the column names referenced by the statement",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// SQL Server login failure.
const MSSQL_LOGIN_FAILED: u32 = 18456;
/// SQL Server "cannot open database requested by the login".
const MSSQL_CANNOT_OPEN_DATABASE: u32 = 4060;

/// Convert tiberius (SQL Server) errors to DbError.
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error as TdsError;

        match err {
            TdsError::Server(token) => {
                let code = token.code();
                if code == MSSQL_LOGIN_FAILED || code == MSSQL_CANNOT_OPEN_DATABASE {
                    return DbError::connection_with_code(
                        token.message().to_string(),
                        Some(code.to_string()),
                        "Verify the username, password and database name",
                    );
                }
                DbError::database(
                    token.message().to_string(),
                    Some(code.to_string()),
                    "Check the SQL syntax and referenced objects",
                )
            }
            TdsError::Io { message, .. } => DbError::connection(
                format!("I/O error: {}", message),
                "Check network connectivity and database server status",
            ),
            TdsError::Tls(message) => DbError::connection(
                format!("TLS error: {}", message),
                "Verify TLS configuration or set trust_server_certificate=true",
            ),
            TdsError::Routing { host, port } => DbError::connection(
                format!("Server requested routing to {}:{}", host, port),
                "Connect to the routed host directly",
            ),
            TdsError::Protocol(message) => DbError::connection(
                format!("Protocol error: {}", message),
                "Check database server compatibility",
            ),
            TdsError::Conversion(message) => {
                DbError::internal(format!("Conversion error: {}", message))
            }
            other => DbError::internal(format!("SQL Server error: {}", other)),
        }
    }
}

/// Convert bb8 pool errors (SQL Server pool) to DbError.
impl From<bb8::RunError<tiberius::error::Error>> for DbError {
    fn from(err: bb8::RunError<tiberius::error::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => e.into(),
            bb8::RunError::TimedOut => DbError::timeout("connection pool acquire", 30),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build error data (suggestion and vendor code) as JSON value.
fn error_data(err: &DbError) -> Option<serde_json::Value> {
    let mut data = serde_json::Map::new();
    if let Some(s) = err.suggestion() {
        data.insert("suggestion".into(), s.into());
    }
    if let Some(code) = err.code() {
        data.insert("code".into(), code.into());
    }
    if data.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(data))
    }
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = error_data(&err);
        match &err {
            DbError::Validation { .. }
            | DbError::UnsupportedVendor { .. }
            | DbError::Database { .. }
            | DbError::ProcedureExecution { .. } => {
                rmcp::ErrorData::invalid_params(err.to_string(), data)
            }

            DbError::ProcedureNotFoundOrDenied { .. } | DbError::ConnectionNotFound { .. } => {
                rmcp::ErrorData::resource_not_found(err.to_string(), data)
            }

            DbError::Connection { .. }
            | DbError::PoolClosed
            | DbError::Timeout { .. }
            | DbError::Cancelled { .. }
            | DbError::Credential { .. }
            | DbError::PartialBatchFailure { .. }
            | DbError::Internal { .. } => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}
