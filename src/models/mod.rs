//! Data models for the database gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;
pub mod schema;
pub mod service;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionKey, ConnectionTestResult, ConnectionValidation, DatabaseType,
    FieldKind, FieldRule,
};
pub use query::{
    ColumnMetadata, ProcedureOptions, ProcedureParam, ProcedureParams, QueryParam, QueryParams,
    QueryResult, Row, TransactionOperation,
};
pub use schema::{ColumnDescriptor, DatabaseObjectDescriptor, ObjectCategory};
pub use service::{
    ALL_PROCEDURES, AccessPolicy, BatchItemResult, BatchOutcome, CallerContext, Environment,
    ProcedureCallRequest, ServiceBinding, ServiceSummary,
};
