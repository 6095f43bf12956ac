//! Protocol sessions with upstream tool servers.
//!
//! A [`Session`] is the live handle after a successful initialize exchange.
//! [`StdioLauncher`] produces sessions by spawning a subprocess and speaking
//! MCP over its stdio pipes via rmcp.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ErrorCode, JsonObject, Tool},
    service::{RunningService, ServiceError},
    transport::TokioChildProcess,
    RoleClient, ServiceExt,
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};

/// Everything needed to start one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub service: String,
    pub command: String,
    pub args: Vec<String>,
    /// Already filtered: placeholders and empty values removed
    pub env: BTreeMap<String, String>,
}

impl From<&ServiceConfig> for LaunchSpec {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            service: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.resolved_env(),
        }
    }
}

/// Live protocol handle, usable between a successful initialize and `close`.
#[async_trait]
pub trait Session: Send + Sync {
    /// List tools with a parameterless request.
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<CallToolResult>;

    /// Re-send the client's half of the initialize exchange.
    async fn reinitialize(&self) -> Result<()>;

    /// False once closed locally or the subprocess went away.
    fn is_open(&self) -> bool;

    /// Idempotent; never fails.
    async fn close(&self);
}

/// Opens sessions. The real implementation spawns subprocesses; tests
/// substitute an in-memory launcher.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn open(&self, spec: &LaunchSpec) -> Result<Arc<dyn Session>>;
}

/// Spawns `command args...` and performs the MCP handshake over its stdio.
#[derive(Debug, Default, Clone)]
pub struct StdioLauncher;

#[async_trait]
impl Launcher for StdioLauncher {
    async fn open(&self, spec: &LaunchSpec) -> Result<Arc<dyn Session>> {
        info!(service = %spec.service, command = %spec.command, args = ?spec.args, "spawning service");

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let transport = TokioChildProcess::new(cmd).map_err(|e| Error::LaunchFailure {
            service: spec.service.clone(),
            reason: e.to_string(),
        })?;

        let client = ().serve(transport).await.map_err(|e| Error::HandshakeFailed {
            service: spec.service.clone(),
            reason: e.to_string(),
        })?;

        if let Some(peer) = client.peer_info() {
            debug!(
                service = %spec.service,
                server = %peer.server_info.name,
                version = %peer.server_info.version,
                "handshake complete"
            );
        }

        Ok(Arc::new(RmcpSession {
            service: spec.service.clone(),
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session backed by an rmcp client over a child process.
pub struct RmcpSession {
    service: String,
    client: RunningService<RoleClient, ()>,
    closed: AtomicBool,
}

impl RmcpSession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed(self.service.clone()))
        }
    }
}

#[async_trait]
impl Session for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.ensure_open()?;
        let result = self
            .client
            .list_tools(Default::default())
            .await
            .map_err(|e| classify(&self.service, e))?;
        Ok(result.tools)
    }

    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<CallToolResult> {
        self.ensure_open()?;
        self.client
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| classify(&self.service, e))
    }

    async fn reinitialize(&self) -> Result<()> {
        self.ensure_open()?;
        self.client
            .peer()
            .notify_initialized()
            .await
            .map_err(|e| classify(&self.service, e))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.client.peer().is_transport_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Ends the service loop, which drops the transport and kills the child.
        self.client.cancellation_token().cancel();
        debug!(service = %self.service, "session closed");
    }
}

/// Map an rmcp failure onto the gateway's taxonomy.
pub fn classify(service: &str, err: ServiceError) -> Error {
    match err {
        ServiceError::McpError(data) => {
            let message = data.message.to_string();
            classify_rpc(service, data.code, message)
        }
        ServiceError::TransportClosed
        | ServiceError::TransportSend(_)
        | ServiceError::Cancelled { .. } => Error::ConnectionClosed(service.to_string()),
        ServiceError::Timeout { timeout } => Error::Timeout {
            service: service.to_string(),
            secs: timeout.as_secs(),
        },
        other => Error::Protocol {
            service: service.to_string(),
            message: other.to_string(),
        },
    }
}

fn classify_rpc(service: &str, code: ErrorCode, message: String) -> Error {
    let lower = message.to_lowercase();
    let mentions_init = lower.contains("initializ");

    if code == ErrorCode::INVALID_REQUEST || code == ErrorCode::INVALID_PARAMS {
        if mentions_init {
            return Error::NotInitialized {
                service: service.to_string(),
                message,
            };
        }
        if code == ErrorCode::INVALID_REQUEST || lower.contains("invalid request") {
            return Error::ProtocolInvalidRequest {
                service: service.to_string(),
                message,
            };
        }
    }

    Error::Protocol {
        service: service.to_string(),
        message,
    }
}
