//! Local commands: tools backed by an HTTP request or a script.
//!
//! `{param}` placeholders in URLs, query params, bodies, script arguments and
//! script environment are replaced with call arguments. Parameters the caller
//! omitted fall back to their configured default. `${VAR}` references in the
//! script environment are expanded per run; the config keeps the raw text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::JsonObject;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::{
    expand_env_refs, CommandConfig, CommandKind, HttpCommand, ResponseFormat, ScriptCommand,
};
use crate::error::{Error, Result};

/// What a local command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Json(Value),
    Text(String),
}

impl CommandOutput {
    /// Text payload for a tool result; structured output is pretty-printed.
    pub fn into_text(self) -> String {
        match self {
            CommandOutput::Json(Value::String(s)) => s,
            CommandOutput::Json(value) => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
            CommandOutput::Text(text) => text,
        }
    }
}

/// Runs one local command with caller-supplied arguments.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &CommandConfig, args: &JsonObject) -> Result<CommandOutput>;
}

/// Executes http commands with reqwest and scripts with tokio::process.
pub struct LocalExecutor {
    client: reqwest::Client,
    default_timeout_secs: AtomicU64,
}

impl LocalExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout_secs: AtomicU64::new(default_timeout.as_secs()),
        }
    }

    /// Applied to commands without their own timeout.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.default_timeout_secs
            .store(timeout.as_secs(), Ordering::Relaxed);
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs.load(Ordering::Relaxed))
    }

    async fn run_http(
        &self,
        name: &str,
        http: &HttpCommand,
        args: &JsonObject,
    ) -> Result<CommandOutput> {
        let fail = |reason: String| Error::LocalCommand {
            name: name.to_string(),
            reason,
        };

        let method = reqwest::Method::from_bytes(http.method.to_uppercase().as_bytes())
            .map_err(|e| fail(format!("invalid method '{}': {e}", http.method)))?;
        let url = render(&http.url, args);
        let timeout = http
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.default_timeout());

        let mut request = self
            .client
            .request(method.clone(), &url)
            .query(&build_query(&http.params, args))
            .timeout(timeout);
        for (key, value) in &http.headers {
            request = request.header(key, value);
        }
        if method != reqwest::Method::GET && method != reqwest::Method::DELETE {
            if let Some(body) = &http.body {
                request = request.json(&render_body(body, args));
            }
        }

        debug!(command = %name, %method, %url, "sending local http command");

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;

        match http.response_format {
            ResponseFormat::Json => response
                .json::<Value>()
                .await
                .map(CommandOutput::Json)
                .map_err(|e| fail(format!("invalid JSON response: {e}"))),
            ResponseFormat::Text => response
                .text()
                .await
                .map(CommandOutput::Text)
                .map_err(|e| fail(e.to_string())),
        }
    }

    async fn run_script(
        &self,
        name: &str,
        script: &ScriptCommand,
        args: &JsonObject,
    ) -> Result<CommandOutput> {
        let fail = |reason: String| Error::LocalCommand {
            name: name.to_string(),
            reason,
        };

        let mut cmd = tokio::process::Command::new(&script.interpreter);
        cmd.arg(&script.path)
            .args(script.args.iter().map(|a| render(a, args)))
            .envs(
                script
                    .env
                    .iter()
                    .map(|(k, v)| (k, render(&expand_env_refs(v), args))),
            )
            .kill_on_drop(true);

        debug!(command = %name, interpreter = %script.interpreter, path = %script.path, "running script");

        let output = tokio::time::timeout(self.default_timeout(), cmd.output())
            .await
            .map_err(|_| fail(format!("timed out after {}s", self.default_timeout().as_secs())))?
            .map_err(|e| fail(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("exited with {}: {}", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(match serde_json::from_str::<Value>(&stdout) {
            Ok(value) => CommandOutput::Json(value),
            Err(_) => CommandOutput::Text(stdout),
        })
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    #[instrument(name = "command.execute", skip_all, fields(command = %command.name))]
    async fn execute(&self, command: &CommandConfig, args: &JsonObject) -> Result<CommandOutput> {
        let args = with_defaults(command, args);
        match &command.kind {
            CommandKind::Http(http) => self.run_http(&command.name, http, &args).await,
            CommandKind::Script(script) => self.run_script(&command.name, script, &args).await,
        }
    }
}

/// Caller arguments plus configured defaults for omitted parameters.
fn with_defaults(command: &CommandConfig, args: &JsonObject) -> JsonObject {
    let mut merged = args.clone();
    for param in &command.parameters {
        if let Some(default) = &param.default {
            merged
                .entry(param.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    merged
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{key}` with the matching argument.
pub fn render(template: &str, args: &JsonObject) -> String {
    args.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), &value_text(value))
    })
}

fn is_placeholder(value: &str) -> bool {
    value.len() > 2 && value.starts_with('{') && value.ends_with('}')
}

/// Query pairs; optional params left as an unfilled placeholder or empty are dropped.
fn build_query(
    params: &std::collections::BTreeMap<String, String>,
    args: &JsonObject,
) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(key, template)| {
            let direct = args
                .get(key)
                .filter(|v| !v.is_null())
                .map(value_text)
                .filter(|v| !v.is_empty());
            let value = direct.unwrap_or_else(|| render(template, args));
            if value.is_empty() || is_placeholder(&value) {
                None
            } else {
                Some((key.clone(), value))
            }
        })
        .collect()
}

/// A string field that is exactly `{param}` takes the argument's JSON value;
/// other strings are rendered as text.
fn render_body(
    body: &std::collections::BTreeMap<String, Value>,
    args: &JsonObject,
) -> JsonObject {
    body.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => {
                    let whole = s
                        .strip_prefix('{')
                        .and_then(|rest| rest.strip_suffix('}'))
                        .and_then(|name| args.get(name));
                    match whole {
                        Some(arg) => arg.clone(),
                        None => Value::String(render(s, args)),
                    }
                }
                other => other.clone(),
            };
            (key.clone(), rendered)
        })
        .collect()
}
