//! Per-service client: cached tool listing and call forwarding.

use std::sync::{Arc, PoisonError, RwLock};

use rmcp::model::{CallToolResult, JsonObject, Tool};
use tracing::{debug, warn};

use super::connection::Connection;
use super::session::{Launcher, Session};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};

/// Lists and invokes tools of one service, opening its connection on first use.
///
/// Calls are never retried here; a connection-closed failure tears the
/// connection down so the next use respawns it.
pub struct ServiceClient {
    config: ServiceConfig,
    connection: Connection,
    tools: RwLock<Option<Vec<Tool>>>,
}

impl ServiceClient {
    pub fn new(config: ServiceConfig, launcher: Arc<dyn Launcher>) -> Self {
        let connection = Connection::new(&config, launcher);
        Self {
            config,
            connection,
            tools: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the connection without listing.
    pub async fn connect(&self) -> Result<()> {
        self.connection.open().await.map(|_| ())
    }

    /// Cached tools, or a fresh listing from the service.
    ///
    /// A not-initialized rejection earns exactly one re-initialize and one
    /// more listing before the error is surfaced.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        if let Some(tools) = self.cached_tools() {
            return Ok(tools);
        }

        let session = self.connection.open().await?;
        let tools = match self.list_once(session.as_ref()).await {
            Ok(tools) => tools,
            Err(e) if e.is_not_initialized() => {
                warn!(service = %self.name(), error = %e, "service not ready, re-initializing");
                if let Err(e) = session.reinitialize().await {
                    return Err(self.observe(e).await);
                }
                match self.list_once(session.as_ref()).await {
                    Ok(tools) => tools,
                    Err(e) => return Err(self.observe(e).await),
                }
            }
            Err(e) => return Err(self.observe(e).await),
        };

        debug!(service = %self.name(), count = tools.len(), "listed tools");
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Some(tools.clone());
        Ok(tools)
    }

    /// Drop the cache and list again.
    pub async fn refresh_tools(&self) -> Result<Vec<Tool>> {
        self.invalidate();
        self.list_tools().await
    }

    /// Forward one call to the service under its original tool name.
    pub async fn invoke(&self, tool: &str, arguments: JsonObject) -> Result<CallToolResult> {
        let session = self.connection.open().await?;
        let timeout = self.connection.call_timeout();

        let result = match tokio::time::timeout(timeout, session.call_tool(tool, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                service: self.name().to_string(),
                secs: timeout.as_secs(),
            }),
        };

        match result {
            Ok(result) => Ok(result),
            Err(e) => Err(self.observe(e).await),
        }
    }

    /// Close the connection and forget cached tools.
    pub async fn disconnect(&self) {
        self.invalidate();
        self.connection.close().await;
    }

    fn invalidate(&self) {
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn list_once(&self, session: &dyn Session) -> Result<Vec<Tool>> {
        let timeout = self.connection.timeout();
        match tokio::time::timeout(timeout, session.list_tools()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                service: self.name().to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Closed connections are cleaned up locally; other failures leave the
    /// connection in place.
    async fn observe(&self, err: Error) -> Error {
        if err.is_connection_closed() {
            self.invalidate();
            self.connection.mark_closed(&err).await;
        }
        err
    }
}
