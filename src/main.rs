//! mcpmux - MCP gateway aggregating stdio tool services
//!
//! Reads its TOML config, supervises every configured service, and serves
//! the merged tool set to one MCP client over stdin/stdout. Logs go to
//! stderr since stdout carries the protocol.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcpmux::admin;
use mcpmux::config::ConfigStore;
use mcpmux::gateway::Gateway;
use mcpmux::mcp::StdioLauncher;
use mcpmux::paths;
use mcpmux::server;
use mcpmux::watcher::{self, ConfigListener};

#[tokio::main]
async fn main() -> Result<()> {
    let cli_path = std::env::args().nth(1);
    let config_path = paths::config_path(cli_path.as_deref());
    paths::ensure_config(&config_path)?;

    let store = Arc::new(
        ConfigStore::open(&config_path)
            .with_context(|| format!("failed to load config: {}", config_path.display()))?,
    );
    let config = store.current();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("mcpmux={}", config.global.log_level)))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // The store logged its load before the subscriber existed
    info!(
        config = %config_path.display(),
        services = config.services.len(),
        commands = config.commands.len(),
        "loaded config"
    );
    info!("starting mcpmux");

    let gateway = Gateway::new(store.clone(), Arc::new(StdioLauncher));
    gateway.start().await;

    let _watcher = if config.global.hot_reload {
        let listener: Arc<dyn ConfigListener> = Arc::new(gateway.clone());
        match watcher::start_watcher(store.clone(), listener) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("hot reload disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    if config.admin.enabled {
        let (addr, _handle) = admin::start_admin_server(&config.admin.listen, gateway.clone()).await?;
        info!(%addr, "admin API started");
    }

    let result = tokio::select! {
        result = server::serve_stdio(gateway.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    gateway.shutdown().await;
    info!("mcpmux stopped");
    result
}
