//! MCP server integration module.
//!
//! Exposes the gateway's services and procedures as MCP tools using the
//! rmcp framework.

pub mod service;

pub use service::GatewayService;
