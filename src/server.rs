//! Downstream MCP server: the gateway as seen by its single client.

use anyhow::{Context, Result};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use tracing::{info, warn};

use crate::gateway::Gateway;

#[derive(Clone)]
pub struct GatewayServer {
    gateway: Gateway,
}

impl GatewayServer {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = if self.gateway.proxy_mode() {
            "mcpmux gateway in proxy mode. Use search_tools to find tools, \
             execute_tool to run them, and list_services to see what is connected."
        } else {
            "mcpmux gateway - tools from every configured service, \
             prefixed where configured."
        };
        ServerInfo {
            instructions: Some(instructions.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.gateway.list_tools().await,
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let name = request.name.as_ref();
        let args = request.arguments.unwrap_or_default();

        match self.gateway.call_tool(name, args).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

/// Serve the gateway over this process's stdin/stdout until the client
/// disconnects.
pub async fn serve_stdio(gateway: Gateway) -> Result<()> {
    let service = GatewayServer::new(gateway)
        .serve(rmcp::transport::stdio())
        .await
        .context("downstream handshake failed")?;
    info!("downstream client connected");

    let reason = service.waiting().await?;
    info!(?reason, "downstream session ended");
    Ok(())
}
