//! End-to-end tests for mcpmux
//!
//! Runs the gateway against the `mcpmux-fixture` stdio server, both through
//! the library and as the real binary speaking MCP over its own stdio.

use anyhow::Result;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    transport::TokioChildProcess,
    ServiceExt,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mcpmux::config::{ConfigStore, GatewayConfig, ServiceConfig};
use mcpmux::gateway::Gateway;
use mcpmux::mcp::StdioLauncher;
use mcpmux::watcher::{self, ConfigListener};

const FIXTURE: &str = env!("CARGO_BIN_EXE_mcpmux-fixture");
const GATEWAY: &str = env!("CARGO_BIN_EXE_mcpmux");
const CONNECT: Duration = Duration::from_secs(30);

// ============================================================================
// Test Helpers
// ============================================================================

fn fixture_service(name: &str) -> ServiceConfig {
    ServiceConfig::new(name, FIXTURE)
}

async fn start_gateway(config: GatewayConfig) -> Result<Gateway> {
    let store = Arc::new(ConfigStore::in_memory(config));
    let gateway = Gateway::new(store, Arc::new(StdioLauncher));
    gateway.start().await;
    for service in &gateway.config().services {
        gateway
            .supervisor()
            .wait_for_connected(&service.name, CONNECT)
            .await?;
    }
    Ok(gateway)
}

fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_config(path: &Path, body: &str) -> Result<()> {
    std::fs::write(path, body)?;
    Ok(())
}

// ============================================================================
// Library-level scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_service_ping() -> Result<()> {
    let gateway = start_gateway(GatewayConfig {
        services: vec![fixture_service("echo")],
        ..GatewayConfig::default()
    })
    .await?;

    let tools = gateway.list_tools().await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    assert!(names.contains(&"ping"), "ping tool should exist");
    assert!(names.contains(&"echo"), "echo tool should exist");

    let result = gateway.call_tool("ping", object(json!({}))).await?;
    assert_eq!(text(&result), "pong");

    let result = gateway
        .call_tool("echo", object(json!({"message": "hello world"})))
        .await?;
    assert_eq!(text(&result), "echo: hello world");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prefixed_weather_service() -> Result<()> {
    let gateway = start_gateway(GatewayConfig {
        services: vec![fixture_service("weather").with_prefix("w")],
        ..GatewayConfig::default()
    })
    .await?;

    let tools = gateway.list_tools().await;
    assert!(tools.iter().any(|t| t.name == "w_forecast"));
    assert!(!tools.iter().any(|t| t.name == "forecast"));

    let result = gateway
        .call_tool("w_forecast", object(json!({"city": "Oslo", "days": 3})))
        .await?;
    assert_eq!(text(&result), "Oslo: sunny for 3 day(s)");

    // Only the display name is callable directly
    let err = gateway
        .call_tool("forecast", object(json!({"city": "Oslo"})))
        .await
        .unwrap_err();
    assert!(matches!(err, mcpmux::Error::ToolNotFound(_)));

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_mode_missing_parameter() -> Result<()> {
    let mut config = GatewayConfig {
        services: vec![fixture_service("weather").with_prefix("w")],
        ..GatewayConfig::default()
    };
    config.global.tool_proxy_mode = true;
    let gateway = start_gateway(config).await?;

    let names: Vec<String> = gateway
        .list_tools()
        .await
        .iter()
        .map(|t| t.name.to_string())
        .collect();
    assert_eq!(names, vec!["search_tools", "execute_tool", "list_services"]);

    let result = gateway
        .call_tool(
            "execute_tool",
            object(json!({"tool_name": "w_forecast", "arguments": {}})),
        )
        .await?;
    let payload: Value = serde_json::from_str(&text(&result))?;
    assert_eq!(payload["success"], false);
    assert_eq!(payload["error"], "missing required parameters: city");
    assert_eq!(payload["result"], Value::Null);

    let result = gateway
        .call_tool(
            "execute_tool",
            object(json!({"tool_name": "forecast", "arguments": {"city": "Lima"}})),
        )
        .await?;
    let payload: Value = serde_json::from_str(&text(&result))?;
    assert_eq!(payload["success"], true);
    assert_eq!(payload["result"], "Lima: sunny for 1 day(s)");
    assert_eq!(payload["tool_name"], "w_forecast");
    assert_eq!(payload["service"], "weather");

    let result = gateway
        .call_tool("search_tools", object(json!({"query": "forecast"})))
        .await?;
    let payload: Value = serde_json::from_str(&text(&result))?;
    assert_eq!(payload["tools"][0]["display_name"], "w_forecast");

    let result = gateway
        .call_tool("list_services", object(json!({})))
        .await?;
    let payload: Value = serde_json::from_str(&text(&result))?;
    assert_eq!(payload["services"][0]["status"], "connected");
    assert_eq!(payload["services"][0]["tool_count"], 4);

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hot_reload_adds_service() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    write_config(&path, "[global]\nhot_reload = true\n")?;

    let store = Arc::new(ConfigStore::open(&path)?);
    let gateway = Gateway::new(store.clone(), Arc::new(StdioLauncher));
    gateway.start().await;
    let listener: Arc<dyn ConfigListener> = Arc::new(gateway.clone());
    let _watcher = watcher::start_watcher(store, listener)?;

    write_config(
        &path,
        &format!(
            "[global]\nhot_reload = true\n\n[[services]]\nname = \"late\"\ncommand = \"{}\"\nprefix = \"l\"\n",
            FIXTURE
        ),
    )?;

    // Reload is debounced and the child then has to handshake
    gateway
        .supervisor()
        .wait_for_connected("late", CONNECT)
        .await?;
    assert!(gateway
        .list_tools()
        .await
        .iter()
        .any(|t| t.name == "l_ping"));

    gateway.shutdown().await;
    Ok(())
}

// ============================================================================
// Binary over stdio
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_gateway_binary_over_stdio() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    write_config(
        &path,
        &format!(
            "[global]\nhot_reload = false\nlog_level = \"warn\"\n\n[[services]]\nname = \"echo\"\ncommand = \"{}\"\n",
            FIXTURE
        ),
    )?;

    let mut cmd = tokio::process::Command::new(GATEWAY);
    cmd.arg(&path).env_remove("MCPMUX_CONFIG");
    let client = ().serve(TokioChildProcess::new(cmd)?).await?;

    // Services connect in the background; poll until the tools show up
    let deadline = tokio::time::Instant::now() + CONNECT;
    loop {
        let tools = client.list_tools(Default::default()).await?;
        if tools.tools.iter().any(|t| t.name == "ping") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ping never appeared"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let result = client
        .call_tool(CallToolRequestParam {
            name: "ping".into(),
            arguments: None,
        })
        .await?;
    assert_eq!(text(&result), "pong");
    assert_ne!(result.is_error, Some(true));

    let result = client
        .call_tool(CallToolRequestParam {
            name: "nonexistent".into(),
            arguments: None,
        })
        .await?;
    assert_eq!(result.is_error, Some(true));
    assert_eq!(text(&result), "tool not found: nonexistent");

    client.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gateway_binary_logs_config_summary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    write_config(
        &path,
        "[global]\nhot_reload = false\nlog_level = \"info\"\n\n[[commands]]\nname = \"noop\"\ntype = \"script\"\npath = \"/bin/true\"\n",
    )?;

    // No client on stdin, so the gateway stops right after startup
    let mut cmd = tokio::process::Command::new(GATEWAY);
    cmd.arg(&path)
        .env_remove("MCPMUX_CONFIG")
        .env_remove("RUST_LOG")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(CONNECT, cmd.output()).await??;

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("loaded config"), "stderr was: {stderr}");
    assert!(stderr.contains("commands=1"), "stderr was: {stderr}");
    Ok(())
}
