//! The gateway: config, supervisor, registry, index and proxy wired together.
//!
//! Everything is passed in explicitly; there is no process-wide state. The
//! downstream server, the admin API and the config watcher all hold clones
//! of the same [`Gateway`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::commands::LocalExecutor;
use crate::config::{CommandConfig, ConfigStore, GatewayConfig, GlobalConfig, ServiceConfig};
use crate::error::Result;
use crate::index::ToolIndex;
use crate::mcp::{Launcher, ServiceStatus, Supervisor, SupervisorSettings};
use crate::proxy::ToolProxy;
use crate::registry::{ToolRegistry, ToolSummary};
use crate::watcher::ConfigListener;

/// A configured service as the admin surface shows it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub description: String,
    pub command: String,
    pub args: Vec<String>,
    pub prefix: Option<String>,
    pub enabled: bool,
    /// Absent until the supervisor has seen the service
    pub status: Option<ServiceStatus>,
}

struct Inner {
    store: Arc<ConfigStore>,
    supervisor: Supervisor,
    registry: Arc<ToolRegistry>,
    index: Arc<ToolIndex>,
    executor: Arc<LocalExecutor>,
    proxy: ToolProxy,
    proxy_mode: AtomicBool,
    /// Serializes admin read-modify-persist cycles and applied reloads
    edits: Mutex<()>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Build a gateway around `store`, launching services with `launcher`.
    ///
    /// Nothing connects until [`Gateway::start`].
    pub fn new(store: Arc<ConfigStore>, launcher: Arc<dyn Launcher>) -> Self {
        let config = store.current();
        let global = &config.global;

        let executor = Arc::new(LocalExecutor::new(global.default_timeout()));
        let registry = Arc::new(ToolRegistry::new(executor.clone()));
        let index = Arc::new(ToolIndex::new());
        let supervisor = Supervisor::new(
            launcher,
            registry.clone(),
            index.clone(),
            SupervisorSettings::from(global),
        );
        let proxy = ToolProxy::new(
            registry.clone(),
            index.clone(),
            supervisor.clone(),
            global.tool_proxy.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                store,
                supervisor,
                registry,
                index,
                executor,
                proxy,
                proxy_mode: AtomicBool::new(global.tool_proxy_mode),
                edits: Mutex::new(()),
            }),
        }
    }

    /// Register local commands and start supervising every enabled service.
    pub async fn start(&self) {
        let config = self.inner.store.current();
        self.inner.registry.register_local(&config.commands).await;
        for service in &config.services {
            self.inner.supervisor.add_service(service.clone()).await;
        }
        info!(
            services = config.services.len(),
            commands = config.commands.len(),
            proxy_mode = self.proxy_mode(),
            "gateway started"
        );
    }

    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.inner.store.current()
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn index(&self) -> &Arc<ToolIndex> {
        &self.inner.index
    }

    pub fn proxy_mode(&self) -> bool {
        self.inner.proxy_mode.load(Ordering::SeqCst)
    }

    fn apply_globals(&self, global: &GlobalConfig) {
        self.inner
            .proxy_mode
            .store(global.tool_proxy_mode, Ordering::SeqCst);
        self.inner.proxy.update(global.tool_proxy.clone());
        self.inner
            .supervisor
            .update_settings(SupervisorSettings::from(global));
        self.inner
            .executor
            .set_default_timeout(global.default_timeout());
    }

    // ========================================================================
    // Downstream surface
    // ========================================================================

    /// Tools advertised to the downstream client.
    ///
    /// Proxy mode advertises the proxy tools, plus local commands when
    /// `expose_local_commands` is set; otherwise the whole merged namespace.
    pub async fn list_tools(&self) -> Vec<Tool> {
        if !self.proxy_mode() {
            return self.inner.registry.list_tools().await;
        }
        let mut tools = self.inner.proxy.tools();
        if self.inner.proxy.settings().expose_local_commands {
            tools.extend(self.inner.registry.local_tools().await);
        }
        tools
    }

    /// Proxy tool names win in proxy mode; everything else goes through the
    /// registry.
    pub async fn call_tool(&self, name: &str, args: JsonObject) -> Result<CallToolResult> {
        if self.proxy_mode() && self.inner.proxy.is_proxy_tool(name) {
            return self.inner.proxy.handle(name, args).await;
        }
        self.inner
            .registry
            .dispatch(name, args, &self.inner.supervisor)
            .await
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    /// Configured services with their live status, in config order.
    pub fn services(&self) -> Vec<ServiceView> {
        self.config()
            .services
            .iter()
            .map(|s| ServiceView {
                name: s.name.clone(),
                description: s.description.clone(),
                command: s.command.clone(),
                args: s.args.clone(),
                prefix: s.prefix.clone(),
                enabled: s.enabled,
                status: self.inner.supervisor.status(&s.name),
            })
            .collect()
    }

    /// Every callable tool with its source.
    pub async fn tools(&self) -> Vec<ToolSummary> {
        self.inner.registry.summaries().await
    }

    /// Add or replace a service, persist it, and start supervising it.
    #[instrument(skip(self, service), fields(service = %service.name))]
    pub async fn add_service(&self, service: ServiceConfig) -> Result<()> {
        let _edit = self.inner.edits.lock().await;
        let mut config = (*self.config()).clone();
        match config.services.iter_mut().find(|s| s.name == service.name) {
            Some(existing) => *existing = service.clone(),
            None => config.services.push(service.clone()),
        }
        self.inner.store.persist(config)?;
        self.inner.supervisor.add_service(service).await;
        Ok(())
    }

    /// Remove a service from the config and stop it. False when unknown.
    #[instrument(skip(self))]
    pub async fn remove_service(&self, name: &str) -> Result<bool> {
        let _edit = self.inner.edits.lock().await;
        let mut config = (*self.config()).clone();
        let before = config.services.len();
        config.services.retain(|s| s.name != name);
        if config.services.len() == before {
            return Ok(false);
        }
        self.inner.store.persist(config)?;
        self.inner.supervisor.remove_service(name).await;
        Ok(true)
    }

    /// Flip a service's `enabled` flag. Returns the new flag, or `None` when
    /// the service is unknown.
    #[instrument(skip(self))]
    pub async fn toggle_service(&self, name: &str) -> Result<Option<bool>> {
        let _edit = self.inner.edits.lock().await;
        let mut config = (*self.config()).clone();
        let Some(service) = config.services.iter_mut().find(|s| s.name == name) else {
            return Ok(None);
        };
        service.enabled = !service.enabled;
        let service = service.clone();
        self.inner.store.persist(config)?;

        let enabled = service.enabled;
        if enabled {
            self.inner.supervisor.add_service(service).await;
        } else {
            self.inner.supervisor.remove_service(name).await;
        }
        info!(enabled, "service toggled");
        Ok(Some(enabled))
    }

    /// Re-list a connected service's tools.
    pub async fn refresh_service(&self, name: &str) -> Result<usize> {
        self.inner.supervisor.refresh_tools(name).await
    }

    /// Add or replace a local command and persist it.
    #[instrument(skip(self, command), fields(command = %command.name))]
    pub async fn add_command(&self, command: CommandConfig) -> Result<()> {
        let _edit = self.inner.edits.lock().await;
        let mut config = (*self.config()).clone();
        match config.commands.iter_mut().find(|c| c.name == command.name) {
            Some(existing) => *existing = command,
            None => config.commands.push(command),
        }
        let config = self.inner.store.persist(config)?;
        // The store already holds this snapshot, so no reload will follow
        self.inner.registry.register_local(&config.commands).await;
        Ok(())
    }

    /// Remove a local command. False when unknown.
    #[instrument(skip(self))]
    pub async fn remove_command(&self, name: &str) -> Result<bool> {
        let _edit = self.inner.edits.lock().await;
        let mut config = (*self.config()).clone();
        let before = config.commands.len();
        config.commands.retain(|c| c.name != name);
        if config.commands.len() == before {
            return Ok(false);
        }
        let config = self.inner.store.persist(config)?;
        self.inner.registry.register_local(&config.commands).await;
        Ok(true)
    }
}

#[async_trait]
impl ConfigListener for Gateway {
    async fn on_config_changed(&self, old: Arc<GatewayConfig>, new: Arc<GatewayConfig>) {
        // Not interleaved with an admin edit
        let _edit = self.inner.edits.lock().await;
        self.apply_globals(&new.global);
        self.inner.registry.register_local(&new.commands).await;
        let report = self
            .inner
            .supervisor
            .reconcile(&old.services, &new.services)
            .await;
        info!(
            started = ?report.started,
            removed = ?report.removed,
            unchanged = report.unchanged.len(),
            "config applied"
        );
    }
}
