//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management keyed by connection signature
//! - Named parameter rewriting and identifier quoting
//! - Type mappings from vendor rows to JSON

pub mod params;
pub mod pool;
pub mod types;

pub use params::{PlaceholderStyle, prepare_statement, quote_identifier, validate_identifier};
pub use pool::{ConnectionManager, ConnectionSummary, DbPool, PooledConnection};
pub use types::RowToJson;
