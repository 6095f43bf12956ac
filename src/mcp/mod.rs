//! Upstream side: stdio MCP services and their supervision.
//!
//! Uses rmcp (official Rust MCP SDK) with the child-process transport.

mod backoff;
mod client;
mod connection;
mod events;
mod session;
mod supervisor;

#[cfg(test)]
pub(crate) mod fake;

pub use backoff::Backoff;
pub use client::ServiceClient;
pub use connection::{effective_timeout, Connection};
pub use events::{EventReceiver, EventSender, ServiceEvent};
pub use session::{classify, LaunchSpec, Launcher, RmcpSession, Session, StdioLauncher};
pub use supervisor::{
    ConnectionState, ReconcileReport, ServiceStatus, Supervisor, SupervisorSettings,
};
