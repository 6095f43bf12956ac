//! Three-tool facade over the whole catalog.
//!
//! Instead of listing every aggregated tool, the downstream client gets
//! `search_tools`, `execute_tool` and `list_services` and discovers the rest
//! on demand. Results are JSON text payloads.

use std::sync::{Arc, PoisonError, RwLock};

use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use rmcp::schemars;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ToolProxyConfig;
use crate::error::{Error, Result};
use crate::index::ToolIndex;
use crate::mcp::Supervisor;
use crate::registry::{Resolution, ToolRegistry};

pub const SEARCH_TOOLS: &str = "search_tools";
pub const EXECUTE_TOOL: &str = "execute_tool";
pub const LIST_SERVICES: &str = "list_services";

/// Service name reported for local commands
const LOCAL_SOURCE: &str = "local";

/// Helper to generate schema without the $schema field
pub fn generate_schema<T: schemars::JsonSchema>() -> Arc<JsonObject> {
    let root = schemars::schema_for!(T);
    let mut value = serde_json::to_value(root).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        Arc::new(obj.clone())
    } else {
        Arc::new(JsonObject::new())
    }
}

/// Parameters for search_tools
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchToolsParams {
    #[schemars(description = "Keywords matched against tool names, descriptions and parameters")]
    #[serde(default)]
    pub query: String,
    #[schemars(description = "Only return tools from this service")]
    pub service_name: Option<String>,
    #[schemars(description = "Maximum number of results")]
    pub limit: Option<usize>,
}

/// Parameters for execute_tool
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecuteToolParams {
    #[schemars(description = "Tool to run, by display name or original name")]
    pub tool_name: String,
    #[schemars(description = "Arguments for the tool as a JSON object")]
    #[serde(default)]
    pub arguments: JsonObject,
}

/// Parameters for list_services
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListServicesParams {}

/// What `execute_tool` resolved a name to.
struct Target {
    display_name: String,
    service: String,
    required: Vec<String>,
}

pub struct ToolProxy {
    registry: Arc<ToolRegistry>,
    index: Arc<ToolIndex>,
    supervisor: Supervisor,
    settings: RwLock<ToolProxyConfig>,
}

impl ToolProxy {
    pub fn new(
        registry: Arc<ToolRegistry>,
        index: Arc<ToolIndex>,
        supervisor: Supervisor,
        settings: ToolProxyConfig,
    ) -> Self {
        Self {
            registry,
            index,
            supervisor,
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> ToolProxyConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, settings: ToolProxyConfig) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// The enabled proxy tools, in a fixed order.
    pub fn tools(&self) -> Vec<Tool> {
        let settings = self.settings();
        let mut tools = Vec::new();
        if settings.enable_search {
            tools.push(Tool::new(
                SEARCH_TOOLS,
                format!(
                    "Search the available tools by keyword across names, descriptions \
                     and parameters. Returns at most {} results unless limit is given.",
                    settings.search_limit
                ),
                generate_schema::<SearchToolsParams>(),
            ));
        }
        if settings.enable_execute {
            tools.push(Tool::new(
                EXECUTE_TOOL,
                "Run a tool found with search_tools, passing its arguments as an object",
                generate_schema::<ExecuteToolParams>(),
            ));
        }
        if settings.enable_list_services {
            tools.push(Tool::new(
                LIST_SERVICES,
                "List the aggregated services with their connection status and tool counts",
                generate_schema::<ListServicesParams>(),
            ));
        }
        tools
    }

    /// True when `name` is one of the currently enabled proxy tools.
    pub fn is_proxy_tool(&self, name: &str) -> bool {
        let settings = self.settings();
        match name {
            SEARCH_TOOLS => settings.enable_search,
            EXECUTE_TOOL => settings.enable_execute,
            LIST_SERVICES => settings.enable_list_services,
            _ => false,
        }
    }

    pub async fn handle(&self, name: &str, args: JsonObject) -> Result<CallToolResult> {
        if !self.is_proxy_tool(name) {
            return Err(Error::ToolNotFound(name.to_string()));
        }
        let args = Value::Object(args);

        let payload = match name {
            SEARCH_TOOLS => self.search(serde_json::from_value(args)?),
            EXECUTE_TOOL => self.execute(serde_json::from_value(args)?).await,
            _ => self.list_services(),
        };

        Ok(CallToolResult::success(vec![Content::text(
            serde_json::to_string_pretty(&payload)?,
        )]))
    }

    fn search(&self, params: SearchToolsParams) -> Value {
        let limit = params.limit.unwrap_or_else(|| self.settings().search_limit);
        let hits = self
            .index
            .search(&params.query, params.service_name.as_deref(), limit);
        debug!(query = %params.query, hits = hits.len(), "tool search");

        json!({
            "tools": hits,
            "total": hits.len(),
            "limit": limit,
            "query": params.query,
            "service_name": params.service_name,
        })
    }

    async fn execute(&self, params: ExecuteToolParams) -> Value {
        let target = match self.target(&params.tool_name).await {
            Some(target) => target,
            None => return failure(&Error::ToolNotFound(params.tool_name)),
        };

        let missing: Vec<String> = target
            .required
            .into_iter()
            .filter(|p| !params.arguments.contains_key(p))
            .collect();
        if !missing.is_empty() {
            return failure(&Error::MissingRequiredParameters(missing));
        }

        let result = self
            .registry
            .dispatch(&target.display_name, params.arguments, &self.supervisor)
            .await;

        match result {
            Ok(result) => {
                let text = result
                    .content
                    .iter()
                    .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
                    .collect::<Vec<_>>()
                    .join("\n");
                if result.is_error.unwrap_or(false) {
                    json!({"success": false, "error": text, "result": null})
                } else {
                    json!({
                        "success": true,
                        "error": null,
                        "result": text,
                        "tool_name": target.display_name,
                        "service": target.service,
                    })
                }
            }
            Err(e) => {
                warn!(tool = %target.display_name, error = %e, "proxied call failed");
                failure(&e)
            }
        }
    }

    /// Resolve through the registry so the target is what `dispatch` calls.
    ///
    /// Original names are accepted when they map to exactly what the index
    /// holds; the index otherwise only supplies parameter metadata.
    async fn target(&self, name: &str) -> Option<Target> {
        let mut display_name = name.to_string();
        let mut resolution = self.registry.resolve(name).await;
        if matches!(resolution, Resolution::NotFound) {
            display_name = self.index.get(name)?.display_name;
            resolution = self.registry.resolve(&display_name).await;
        }

        match resolution {
            Resolution::Local(command) => Some(Target {
                display_name: command.name.clone(),
                service: LOCAL_SOURCE.to_string(),
                required: command
                    .parameters
                    .iter()
                    .filter(|p| p.required && p.default.is_none())
                    .map(|p| p.name.clone())
                    .collect(),
            }),
            Resolution::Remote { service, original } => {
                let required = self
                    .index
                    .entry(&service, &original)
                    .map(|e| e.required_parameters().map(str::to_string).collect())
                    .unwrap_or_default();
                Some(Target {
                    display_name,
                    service,
                    required,
                })
            }
            Resolution::NotFound => None,
        }
    }

    fn list_services(&self) -> Value {
        let mut services = self.index.services();

        // Services without tools yet (connecting, failed) still get a row
        for status in self.supervisor.statuses() {
            if !services.iter().any(|s| s.name == status.name) {
                services.push(crate::index::ServiceSummary {
                    description: self
                        .supervisor
                        .service_description(&status.name)
                        .unwrap_or_default(),
                    name: status.name,
                    tool_count: 0,
                });
            }
        }

        let rows: Vec<Value> = services
            .into_iter()
            .map(|s| {
                let status = self
                    .supervisor
                    .status(&s.name)
                    .map(|st| st.state.as_str())
                    .unwrap_or("unknown");
                json!({
                    "name": s.name,
                    "description": s.description,
                    "status": status,
                    "tool_count": s.tool_count,
                })
            })
            .collect();

        json!({"total": rows.len(), "services": rows})
    }
}

fn failure(error: &Error) -> Value {
    json!({"success": false, "error": error.to_string(), "result": null})
}
