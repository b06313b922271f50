//! Request-time services built on the connection manager.
//!
//! - [`DatabaseService`]: connection probes, ad-hoc queries and introspection
//! - [`ServiceRegistry`]: logical service names per environment
//! - [`ProcedureDispatcher`]: authorized, projected stored procedure calls
//! - [`ConnectionCatalog`]: persisted connection definitions

pub mod catalog;
pub mod database;
pub mod dispatcher;
pub mod registry;

pub use catalog::{
    ConnectionCatalog, ConnectionStore, DeleteOutcome, InMemoryConnectionStore,
    StoredConnection, TableColumnsResponse,
};
pub use database::DatabaseService;
pub use dispatcher::{PolicyAuthorizer, ProcedureAuthorizer, ProcedureDispatcher, project_rows};
pub use registry::ServiceRegistry;
