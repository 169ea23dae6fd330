//! mcpaas library
//!
//! Core functionality for the MCP-as-a-Service gateway: spawn installable
//! npm/PyPI MCP server packages as local children and bridge them to remote
//! clients over SSE + POST. This library can be embedded in other
//! applications; the integration tests drive it in-process.

pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod types;
pub mod validate;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::GatewayServer;
