//! mcpmux - one MCP endpoint in front of many stdio MCP services
//!
//! Services are spawned and supervised by [`mcp::Supervisor`], their tools
//! merged with local commands in [`registry::ToolRegistry`] and indexed for
//! search in [`index::ToolIndex`]. [`gateway::Gateway`] wires it together;
//! the main binary serves it over stdio.

pub mod admin;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod index;
pub mod mcp;
pub mod paths;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod watcher;

pub use error::{Error, Result};
