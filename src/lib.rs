//! Database Gateway Library
//!
//! Pooled connections to MySQL, PostgreSQL, SQL Server and SQLite, schema
//! introspection, and stored procedure dispatch through named services,
//! exposed to clients as MCP tools.

pub mod config;
pub mod credentials;
pub mod db;
pub mod drivers;
pub mod error;
pub mod mcp;
pub mod models;
pub mod service;
pub mod transport;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use mcp::GatewayService;
