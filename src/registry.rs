//! Merged tool namespace: local commands plus every connected service's tools.
//!
//! Local commands always shadow a remote tool with the same display name,
//! both in listings and when resolving a call.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::commands::CommandExecutor;
use crate::config::CommandConfig;
use crate::error::{Error, Result};

/// Name a remote tool is exposed under.
pub fn display_name(original: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}_{original}"),
        _ => original.to_string(),
    }
}

/// JSON schema for a local command's typed parameters.
pub fn command_schema(command: &CommandConfig) -> JsonObject {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for param in &command.parameters {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(param.kind.as_str()));
        if !param.description.is_empty() {
            prop.insert("description".into(), json!(param.description));
        }
        if let Some(default) = &param.default {
            prop.insert("default".into(), default.clone());
        }
        properties.insert(param.name.clone(), Value::Object(prop));
        if param.required {
            required.push(param.name.clone());
        }
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    schema.insert("required".into(), json!(required));
    schema
}

/// Calls a tool on a named service under its original name.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(&self, service: &str, tool: &str, args: JsonObject) -> Result<CallToolResult>;
}

/// One remote tool as seen through the merged namespace.
#[derive(Debug, Clone)]
pub struct ToolRegistration {
    pub display_name: String,
    pub original_name: String,
    pub service_name: String,
    pub prefix: Option<String>,
    /// Descriptor as exposed downstream (carries the display name)
    pub tool: Tool,
}

#[derive(Debug, Clone)]
struct LocalTool {
    command: CommandConfig,
    tool: Tool,
}

/// Outcome of looking up a display name.
#[derive(Debug, Clone)]
pub enum Resolution {
    Local(CommandConfig),
    Remote { service: String, original: String },
    NotFound,
}

/// Where a listed tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    /// `local` or the owning service's name
    pub source: String,
}

#[derive(Default)]
struct RegistryState {
    local: Vec<LocalTool>,
    remote: Vec<ToolRegistration>,
}

impl RegistryState {
    fn local(&self, name: &str) -> Option<&LocalTool> {
        self.local.iter().find(|l| l.tool.name == name)
    }

    fn is_shadowed(&self, registration: &ToolRegistration) -> bool {
        self.local(&registration.display_name).is_some()
    }
}

/// Single source of truth for what can be called and how.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    executor: Arc<dyn CommandExecutor>,
}

impl ToolRegistry {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            executor,
        }
    }

    /// Replace the local command set. Disabled commands are skipped.
    pub async fn register_local(&self, commands: &[CommandConfig]) {
        let local: Vec<LocalTool> = commands
            .iter()
            .filter(|c| c.enabled)
            .map(|command| LocalTool {
                tool: Tool::new(
                    command.name.clone(),
                    command.description.clone(),
                    Arc::new(command_schema(command)),
                ),
                command: command.clone(),
            })
            .collect();

        let mut state = self.state.write().await;
        for registration in &state.remote {
            if local.iter().any(|l| l.tool.name == registration.display_name) {
                warn!(
                    tool = %registration.display_name,
                    service = %registration.service_name,
                    "local command shadows remote tool"
                );
            }
        }
        info!(count = local.len(), "registered local commands");
        state.local = local;
    }

    /// Register a service's tools, replacing whatever it registered before.
    ///
    /// Returns the registrations so callers can mirror them elsewhere.
    pub async fn register_remote(
        &self,
        service: &str,
        tools: &[Tool],
        prefix: Option<&str>,
    ) -> Vec<ToolRegistration> {
        let registrations: Vec<ToolRegistration> = tools
            .iter()
            .map(|tool| {
                let display = display_name(&tool.name, prefix);
                let mut exposed = tool.clone();
                exposed.name = display.clone().into();
                ToolRegistration {
                    display_name: display,
                    original_name: tool.name.to_string(),
                    service_name: service.to_string(),
                    prefix: prefix.map(str::to_string),
                    tool: exposed,
                }
            })
            .collect();

        let mut state = self.state.write().await;
        state.remote.retain(|r| r.service_name != service);

        for registration in &registrations {
            if state.local(&registration.display_name).is_some() {
                warn!(
                    tool = %registration.display_name,
                    service,
                    "remote tool hidden by local command"
                );
            }
            let before = state.remote.len();
            state
                .remote
                .retain(|r| r.display_name != registration.display_name);
            if state.remote.len() != before {
                warn!(
                    tool = %registration.display_name,
                    service,
                    "tool name collides with another service, latest registration wins"
                );
            }
        }
        state.remote.extend(registrations.iter().cloned());

        debug!(service, count = registrations.len(), "registered remote tools");
        registrations
    }

    /// Remove every registration owned by `service`. Returns how many went.
    pub async fn unregister_remote(&self, service: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.remote.len();
        state.remote.retain(|r| r.service_name != service);
        before - state.remote.len()
    }

    pub async fn resolve(&self, name: &str) -> Resolution {
        let state = self.state.read().await;
        if let Some(local) = state.local(name) {
            return Resolution::Local(local.command.clone());
        }
        match state.remote.iter().find(|r| r.display_name == name) {
            Some(r) => Resolution::Remote {
                service: r.service_name.clone(),
                original: r.original_name.clone(),
            },
            None => Resolution::NotFound,
        }
    }

    /// Full merged listing: local commands, then unshadowed remote tools.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let state = self.state.read().await;
        state
            .local
            .iter()
            .map(|l| l.tool.clone())
            .chain(
                state
                    .remote
                    .iter()
                    .filter(|r| !state.is_shadowed(r))
                    .map(|r| r.tool.clone()),
            )
            .collect()
    }

    pub async fn local_tools(&self) -> Vec<Tool> {
        let state = self.state.read().await;
        state.local.iter().map(|l| l.tool.clone()).collect()
    }

    /// Listing with provenance, for the admin surface.
    pub async fn summaries(&self) -> Vec<ToolSummary> {
        let state = self.state.read().await;
        let local = state.local.iter().map(|l| ToolSummary {
            name: l.command.name.clone(),
            description: l.command.description.clone(),
            source: "local".to_string(),
        });
        let remote = state
            .remote
            .iter()
            .filter(|r| !state.is_shadowed(r))
            .map(|r| ToolSummary {
                name: r.display_name.clone(),
                description: r.tool.description.as_deref().unwrap_or_default().to_string(),
                source: r.service_name.clone(),
            });
        local.chain(remote).collect()
    }

    pub async fn remote_count(&self, service: &str) -> usize {
        let state = self.state.read().await;
        state
            .remote
            .iter()
            .filter(|r| r.service_name == service)
            .count()
    }

    /// Route a call to its local command or owning service.
    pub async fn dispatch(
        &self,
        name: &str,
        args: JsonObject,
        remote: &dyn RemoteInvoker,
    ) -> Result<CallToolResult> {
        match self.resolve(name).await {
            Resolution::Local(command) => {
                debug!(tool = name, "dispatching to local command");
                let output = self.executor.execute(&command, &args).await?;
                Ok(CallToolResult::success(vec![Content::text(
                    output.into_text(),
                )]))
            }
            Resolution::Remote { service, original } => {
                debug!(tool = name, %service, %original, "dispatching to service");
                remote.invoke(&service, &original, args).await
            }
            Resolution::NotFound => Err(Error::ToolNotFound(name.to_string())),
        }
    }
}
