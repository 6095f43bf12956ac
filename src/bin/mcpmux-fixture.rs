//! Tiny stdio MCP server used for smoke and end-to-end tests.
//!
//! Tools: `ping`, `echo`, `add`, and `forecast` (requires `city`).

use anyhow::Result;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ServerHandler, ServiceExt,
};

/// Parameters for echo tool
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct EchoParams {
    #[schemars(description = "Message to echo back")]
    message: String,
}

/// Parameters for add tool
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct AddParams {
    #[schemars(description = "First number")]
    a: i64,
    #[schemars(description = "Second number")]
    b: i64,
}

/// Parameters for forecast tool
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct ForecastParams {
    #[schemars(description = "City to forecast")]
    city: String,
    #[schemars(description = "Number of days (default 1)")]
    days: Option<u32>,
}

#[derive(Clone)]
struct Fixture {
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl Fixture {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Returns 'pong' - simple connectivity test")]
    async fn ping(&self) -> String {
        "pong".to_string()
    }

    #[tool(description = "Echoes back the input message")]
    async fn echo(&self, Parameters(params): Parameters<EchoParams>) -> String {
        format!("echo: {}", params.message)
    }

    #[tool(description = "Adds two numbers together")]
    async fn add(&self, Parameters(params): Parameters<AddParams>) -> String {
        format!("{}", params.a + params.b)
    }

    #[tool(description = "Weather forecast for a city")]
    async fn forecast(&self, Parameters(params): Parameters<ForecastParams>) -> String {
        let days = params.days.unwrap_or(1);
        format!("{}: sunny for {} day(s)", params.city, days)
    }
}

#[tool_handler]
impl ServerHandler for Fixture {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Test fixture with ping, echo, add and forecast tools".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let service = Fixture::new().serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
