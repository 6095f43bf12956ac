//! Gateway configuration: typed snapshot, TOML loading, and the live store.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_service_timeout() -> u64 {
    30
}

/// Full configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

/// Gateway-wide knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Fallback timeout for local http commands, in seconds
    pub default_timeout: u64,
    /// Retry ceiling for initial connection failures
    pub max_retries: u32,
    /// Backoff floor between retries, in seconds
    pub retry_delay: u64,
    /// Default tracing directive when RUST_LOG is unset
    pub log_level: String,
    /// Watch the config file and reconcile on change
    pub hot_reload: bool,
    /// Expose search/execute/list_services instead of the full catalog
    pub tool_proxy_mode: bool,
    /// Seconds between liveness checks of connected services
    pub liveness_interval: u64,
    pub tool_proxy: ToolProxyConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout: 30,
            max_retries: 3,
            retry_delay: 1,
            log_level: "info".to_string(),
            hot_reload: true,
            tool_proxy_mode: false,
            liveness_interval: 30,
            tool_proxy: ToolProxyConfig::default(),
        }
    }
}

impl GlobalConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }
}

/// Proxy facade switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolProxyConfig {
    pub enable_search: bool,
    pub enable_execute: bool,
    pub enable_list_services: bool,
    /// Default result cap for search_tools
    pub search_limit: usize,
    /// List local commands next to the proxy tools
    pub expose_local_commands: bool,
}

impl Default for ToolProxyConfig {
    fn default() -> Self {
        Self {
            enable_search: true,
            enable_execute: true,
            enable_list_services: true,
            search_limit: 20,
            expose_local_commands: false,
        }
    }
}

/// Admin API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:18888".to_string(),
        }
    }
}

/// One upstream stdio tool server.
///
/// Compared by value during reconciliation: any field change restarts the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-call timeout in seconds; also the base for the handshake tiering
    #[serde(default = "default_service_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: default_service_timeout(),
            prefix: None,
            enabled: true,
            retry_on_failure: true,
            auto_reconnect: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Configured environment with `${VAR}` references expanded.
    ///
    /// Entries that end up empty or still hold an unresolved placeholder are
    /// dropped so the child inherits the gateway's own value.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|(key, raw)| {
                let value = expand_env_refs(raw);
                if value.is_empty() || value.contains("${") {
                    None
                } else {
                    Some((key.clone(), value))
                }
            })
            .collect()
    }
}

/// Local command definition (http or script backed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: CommandKind,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

/// Closed set of local command backends, each carrying only its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommandKind {
    Http(HttpCommand),
    Script(ScriptCommand),
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Http(_) => "http",
            CommandKind::Script(_) => "script",
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCommand {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BTreeMap<String, Value>>,
    /// Seconds; falls back to `global.default_timeout`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
    Text,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCommand {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Typed parameter of a local command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// JSON-schema type name
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!(
            services = config.services.len(),
            commands = config.commands.len(),
            "loaded config from {}",
            path.display()
        );

        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject duplicate names and empty launch commands.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(Error::Config("service with empty name".into()));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            if service.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "service '{}' has no command",
                    service.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for command in &self.commands {
            if !seen.insert(command.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate command name '{}'",
                    command.name
                )));
            }
            let mut params = HashSet::new();
            for param in &command.parameters {
                if !params.insert(param.name.as_str()) {
                    return Err(Error::Config(format!(
                        "command '{}' declares parameter '{}' twice",
                        command.name, param.name
                    )));
                }
            }
        }

        if self.global.tool_proxy.search_limit == 0 {
            return Err(Error::Config("tool_proxy.search_limit must be > 0".into()));
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn enabled_commands(&self) -> impl Iterator<Item = &CommandConfig> {
        self.commands.iter().filter(|c| c.enabled)
    }

}

/// Replace `${VAR}` with the process environment value, leaving unknown
/// references untouched.
pub fn expand_env_refs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(resolved) => out.push_str(&resolved),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Live configuration snapshot bound to its file.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<GatewayConfig>>,
}

impl ConfigStore {
    /// Load the file at `path` and hold it as the current snapshot.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = GatewayConfig::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Store without a backing file; `persist` only swaps the snapshot.
    pub fn in_memory(config: GatewayConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<GatewayConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the file. Returns `(old, new)` only when the content changed.
    pub fn reload(&self) -> anyhow::Result<Option<(Arc<GatewayConfig>, Arc<GatewayConfig>)>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let new = Arc::new(GatewayConfig::load(path)?);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if **current == *new {
            return Ok(None);
        }
        let old = std::mem::replace(&mut *current, new.clone());
        Ok(Some((old, new)))
    }

    /// Write `config` to disk and adopt it as the current snapshot, so the
    /// watcher's follow-up reload sees no difference.
    pub fn persist(&self, config: GatewayConfig) -> Result<Arc<GatewayConfig>> {
        config.validate()?;
        if let Some(path) = &self.path {
            std::fs::write(path, config.to_toml_string()?)?;
        }
        let config = Arc::new(config);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(config)
    }
}
