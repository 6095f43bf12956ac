//! Service supervisor: connection state machine, retries, liveness.
//!
//! Each service name owns at most one background task. The task runs the
//! whole chain for that service:
//! - initial connect, retried with exponential backoff up to `max_retries`
//! - liveness monitoring while connected, with optional reconnect
//!
//! `add_service`, `remove_service`, `reconcile` and `shutdown` serialize on
//! the task table, so no two chains for the same name ever overlap.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::ServiceClient;
use super::events::{EventReceiver, EventSender, ServiceEvent};
use super::session::Launcher;
use super::Backoff;
use crate::config::{GlobalConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::index::{IndexEntry, ToolIndex};
use crate::registry::{RemoteInvoker, ToolRegistry};

/// Connection state of one service. A name with no state was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// An attempt is in flight.
    Connecting,
    /// Handshake and initial listing succeeded.
    Connected { tool_count: usize },
    /// The last attempt failed or the connection was lost.
    Error {
        message: String,
        attempt: u32,
        /// Retries are used up; only an explicit add leaves this state.
        exhausted: bool,
    },
    /// Removed, disabled, or shut down.
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Error { .. } => "error",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Snapshot of one service for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    #[serde(flatten)]
    pub state: ConnectionState,
    pub updated_at: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn tool_count(&self) -> usize {
        match self.state {
            ConnectionState::Connected { tool_count } => tool_count,
            _ => 0,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Error { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Global knobs read when a chain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub liveness_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&GlobalConfig::default())
    }
}

impl From<&GlobalConfig> for SupervisorSettings {
    fn from(global: &GlobalConfig) -> Self {
        Self {
            max_retries: global.max_retries,
            retry_delay: global.retry_delay(),
            liveness_interval: global.liveness_interval(),
        }
    }
}

/// What a reconcile pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Added or restarted because new or changed
    pub started: Vec<String>,
    /// Removed because gone or disabled
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

struct TaskSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    launcher: Arc<dyn Launcher>,
    settings: RwLock<SupervisorSettings>,
    clients: DashMap<String, Arc<ServiceClient>>,
    states: DashMap<String, ServiceStatus>,
    /// Serializes control operations per name; background tasks never take it
    tasks: tokio::sync::Mutex<HashMap<String, TaskSlot>>,
    registry: Arc<ToolRegistry>,
    index: Arc<ToolIndex>,
    events: EventSender,
}

/// Owns every service client and drives all state transitions.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        registry: Arc<ToolRegistry>,
        index: Arc<ToolIndex>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                settings: RwLock::new(settings),
                clients: DashMap::new(),
                states: DashMap::new(),
                tasks: tokio::sync::Mutex::new(HashMap::new()),
                registry,
                index,
                events: EventSender::default(),
            }),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> SupervisorSettings {
        *self
            .inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies to chains started after this call.
    pub fn update_settings(&self, settings: SupervisorSettings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    // ========================================================================
    // Control plane
    // ========================================================================

    /// Start supervising `config`, replacing any existing entry of that name.
    ///
    /// Returns immediately; connecting happens in the background. A disabled
    /// config only removes the existing entry.
    #[instrument(skip(self, config), fields(service = %config.name))]
    pub async fn add_service(&self, config: ServiceConfig) {
        let mut tasks = self.inner.tasks.lock().await;
        self.remove_locked(&mut tasks, &config.name).await;

        if !config.enabled {
            info!("service disabled, not starting");
            return;
        }

        let name = config.name.clone();
        let client = Arc::new(ServiceClient::new(config, self.inner.launcher.clone()));
        self.inner.clients.insert(name.clone(), client.clone());
        self.set_state(&name, ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_chain(self.clone(), client, cancel.clone()));
        tasks.insert(name, TaskSlot { cancel, handle });
        info!("service added");
    }

    /// Stop supervising `name`, close its connection and drop its tools.
    ///
    /// Returns false when the name was unknown.
    #[instrument(skip(self))]
    pub async fn remove_service(&self, name: &str) -> bool {
        let mut tasks = self.inner.tasks.lock().await;
        self.remove_locked(&mut tasks, name).await
    }

    /// Apply the difference between two service lists.
    ///
    /// New or changed (by full value) services are re-added when enabled and
    /// removed when disabled; services missing from `new` are removed.
    #[instrument(skip_all, fields(old = old.len(), new = new.len()))]
    pub async fn reconcile(&self, old: &[ServiceConfig], new: &[ServiceConfig]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for service in new {
            let previous = old.iter().find(|s| s.name == service.name);
            if previous == Some(service) {
                report.unchanged.push(service.name.clone());
                continue;
            }
            if service.enabled {
                self.add_service(service.clone()).await;
                report.started.push(service.name.clone());
            } else {
                self.remove_service(&service.name).await;
                report.removed.push(service.name.clone());
            }
        }

        for service in old {
            if !new.iter().any(|s| s.name == service.name) {
                self.remove_service(&service.name).await;
                report.removed.push(service.name.clone());
            }
        }

        info!(
            started = report.started.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged.len(),
            "reconciled services"
        );
        report
    }

    /// Cancel every background task and remove every service.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        for entry in self.inner.clients.iter() {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        let removals: Vec<_> = names
            .iter()
            .map(|name| {
                let slot = tasks.remove(name);
                self.teardown(name, slot)
            })
            .collect();
        futures::future::join_all(removals).await;
        info!("supervisor shut down");
    }

    async fn remove_locked(&self, tasks: &mut HashMap<String, TaskSlot>, name: &str) -> bool {
        let slot = tasks.remove(name);
        self.teardown(name, slot).await
    }

    /// Cancel the chain, close the client and drop its tools.
    async fn teardown(&self, name: &str, slot: Option<TaskSlot>) -> bool {
        let had_task = slot.is_some();
        if let Some(slot) = slot {
            slot.cancel.cancel();
            if let Err(e) = slot.handle.await {
                if e.is_panic() {
                    warn!(service = name, "background task panicked");
                }
            }
        }

        let client = self.inner.clients.remove(name).map(|(_, c)| c);
        let existed = had_task || client.is_some();
        if let Some(client) = client {
            client.disconnect().await;
        }

        self.inner.registry.unregister_remote(name).await;
        self.inner.index.remove_all_for_service(name);

        if existed {
            self.set_state(name, ConnectionState::Disconnected);
            self.inner.events.send(ServiceEvent::Removed {
                name: name.to_string(),
            });
            info!(service = name, "service removed");
        }
        existed
    }

    // ========================================================================
    // Queries (lock-free snapshots)
    // ========================================================================

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.inner.states.get(name).map(|s| s.value().clone())
    }

    /// All known services, sorted by name.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let mut all: Vec<ServiceStatus> = self
            .inner
            .states
            .iter()
            .map(|s| s.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.status(name)
            .is_some_and(|s| matches!(s.state, ConnectionState::Connected { .. }))
    }

    pub fn client(&self, name: &str) -> Option<Arc<ServiceClient>> {
        self.inner.clients.get(name).map(|c| c.value().clone())
    }

    pub fn service_description(&self, name: &str) -> Option<String> {
        self.client(name).map(|c| c.config().description.clone())
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Call `tool` (original name) on `service`. Never retried.
    pub async fn invoke(&self, service: &str, tool: &str, args: JsonObject) -> Result<CallToolResult> {
        let client = self
            .client(service)
            .ok_or_else(|| Error::ServiceNotConnected(service.to_string()))?;
        debug!(service, tool, "invoking tool");
        client.invoke(tool, args).await
    }

    /// Re-list a connected service's tools and re-register them.
    ///
    /// Only a live connection is refreshed; a service in `Error` is left to
    /// its chain (or an explicit add) and never respawned from here.
    #[instrument(skip(self))]
    pub async fn refresh_tools(&self, name: &str) -> Result<usize> {
        // Ordered with add/remove
        let _tasks = self.inner.tasks.lock().await;
        let not_connected = || Error::ServiceNotConnected(name.to_string());

        let client = self.client(name).ok_or_else(not_connected)?;
        if !self.is_connected(name) || !client.is_connected() {
            return Err(not_connected());
        }
        let tools = client.refresh_tools().await?;

        // Lost while listing; the monitor owns that transition
        if !self.is_connected(name) {
            return Err(not_connected());
        }

        let tool_count = self.publish(&client, &tools).await;
        self.inner.events.send(ServiceEvent::ToolsRefreshed {
            name: name.to_string(),
            tool_count,
        });
        Ok(tool_count)
    }

    /// Poll until `name` is connected.
    ///
    /// Fails early with `RetriesExhausted` once the retry budget is spent.
    pub async fn wait_for_connected(&self, name: &str, timeout: Duration) -> Result<()> {
        let poll = Duration::from_millis(50);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.status(name) {
                match status.state {
                    ConnectionState::Connected { .. } => return Ok(()),
                    ConnectionState::Error {
                        exhausted: true,
                        attempt,
                        ..
                    } => {
                        return Err(Error::RetriesExhausted {
                            service: name.to_string(),
                            attempts: attempt,
                        })
                    }
                    _ => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    service: name.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ========================================================================
    // Background chain
    // ========================================================================

    fn set_state(&self, name: &str, state: ConnectionState) {
        self.inner.states.insert(
            name.to_string(),
            ServiceStatus {
                name: name.to_string(),
                state,
                updated_at: Utc::now(),
            },
        );
    }

    fn emit(&self, event: ServiceEvent) {
        self.inner.events.send(event);
    }

    /// Push a service's tools into the registry and index, then mark it connected.
    async fn publish(&self, client: &ServiceClient, tools: &[Tool]) -> usize {
        let name = client.name();
        let config = client.config();
        let registrations = self
            .inner
            .registry
            .register_remote(name, tools, config.prefix.as_deref())
            .await;
        let entries = tools
            .iter()
            .zip(&registrations)
            .map(|(tool, reg)| {
                IndexEntry::from_tool(tool, reg.display_name.clone(), name, config.description.clone())
            })
            .collect();
        self.inner.index.replace_service(name, entries);

        let tool_count = tools.len();
        self.set_state(name, ConnectionState::Connected { tool_count });
        tool_count
    }

    /// Open, list, and publish.
    async fn establish(&self, client: &ServiceClient) -> Result<usize> {
        let tools = client.refresh_tools().await?;
        Ok(self.publish(client, &tools).await)
    }

    /// Initial connect with bounded retries, then liveness monitoring.
    async fn supervise(&self, client: Arc<ServiceClient>) {
        let settings = self.settings();
        let name = client.name().to_string();
        let retry = client.config().retry_on_failure;
        let max_attempts = settings.max_retries.max(1);
        let mut backoff = Backoff::with_floor(settings.retry_delay);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.set_state(&name, ConnectionState::Connecting);
            self.emit(ServiceEvent::Connecting {
                name: name.clone(),
                attempt,
            });

            match self.establish(&client).await {
                Ok(tool_count) => {
                    info!(service = %name, tool_count, attempt, "service connected");
                    self.emit(ServiceEvent::Connected {
                        name: name.clone(),
                        tool_count,
                    });
                    break;
                }
                Err(e) => {
                    // Leave nothing running while we wait
                    client.disconnect().await;
                    let message = e.to_string();

                    if !retry || attempt >= max_attempts {
                        warn!(service = %name, attempt, error = %message, "giving up on service");
                        self.set_state(
                            &name,
                            ConnectionState::Error {
                                message: message.clone(),
                                attempt,
                                exhausted: retry,
                            },
                        );
                        self.emit(ServiceEvent::Failed {
                            name: name.clone(),
                            attempt,
                            error: message,
                            retry_in_ms: None,
                        });
                        if retry {
                            self.emit(ServiceEvent::RetriesExhausted {
                                name: name.clone(),
                                attempts: attempt,
                            });
                        }
                        return;
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        service = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "connection failed, will retry"
                    );
                    self.set_state(
                        &name,
                        ConnectionState::Error {
                            message: message.clone(),
                            attempt,
                            exhausted: false,
                        },
                    );
                    self.emit(ServiceEvent::Failed {
                        name: name.clone(),
                        attempt,
                        error: message,
                        retry_in_ms: Some(delay.as_millis() as u64),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.monitor(&client, settings.liveness_interval).await;
    }

    /// Check the connection every `interval`; reconnect if allowed.
    ///
    /// A failed reconnect is logged and retried on the next tick; it never
    /// enters the backoff path.
    async fn monitor(&self, client: &ServiceClient, interval: Duration) {
        let name = client.name().to_string();
        let mut lost = false;

        loop {
            tokio::time::sleep(interval).await;
            if client.is_connected() {
                continue;
            }

            if !lost {
                lost = true;
                warn!(service = %name, "connection lost");
                self.emit(ServiceEvent::ConnectionLost { name: name.clone() });
                self.set_state(
                    &name,
                    ConnectionState::Error {
                        message: "connection lost".to_string(),
                        attempt: 0,
                        exhausted: false,
                    },
                );
                self.inner.registry.unregister_remote(&name).await;
                self.inner.index.remove_all_for_service(&name);
                client.disconnect().await;
            }

            if !client.config().auto_reconnect {
                info!(service = %name, "auto reconnect disabled, monitor stopping");
                return;
            }

            self.emit(ServiceEvent::Reconnecting { name: name.clone() });
            match self.establish(client).await {
                Ok(tool_count) => {
                    lost = false;
                    info!(service = %name, tool_count, "service reconnected");
                    self.emit(ServiceEvent::Reconnected {
                        name: name.clone(),
                        tool_count,
                    });
                }
                Err(e) => {
                    client.disconnect().await;
                    warn!(service = %name, error = %e, "reconnect failed");
                    self.set_state(
                        &name,
                        ConnectionState::Error {
                            message: e.to_string(),
                            attempt: 0,
                            exhausted: false,
                        },
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteInvoker for Supervisor {
    async fn invoke(&self, service: &str, tool: &str, args: JsonObject) -> Result<CallToolResult> {
        Supervisor::invoke(self, service, tool, args).await
    }
}

/// Body of a service's task slot.
#[instrument(name = "service.chain", skip_all, fields(service = %client.name()))]
async fn run_chain(supervisor: Supervisor, client: Arc<ServiceClient>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => debug!("background task cancelled"),
        _ = supervisor.supervise(client.clone()) => debug!("background task finished"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::LocalExecutor;
    use crate::mcp::fake::{tool, Behavior, FakeLauncher};

    const WAIT: Duration = Duration::from_secs(600);

    fn supervisor(launcher: &Arc<FakeLauncher>) -> Supervisor {
        supervisor_with(launcher, SupervisorSettings::default())
    }

    fn supervisor_with(launcher: &Arc<FakeLauncher>, settings: SupervisorSettings) -> Supervisor {
        let registry = Arc::new(ToolRegistry::new(Arc::new(LocalExecutor::new(
            Duration::from_secs(5),
        ))));
        Supervisor::new(launcher.clone(), registry, Arc::new(ToolIndex::new()), settings)
    }

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig::new(name, "fake-tool")
    }

    async fn expect<F>(rx: &mut EventReceiver, pred: F) -> ServiceEvent
    where
        F: FnMut(&ServiceEvent) -> bool,
    {
        tokio::time::timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("event did not arrive")
            .expect("event channel closed")
    }

    fn tool_names(tools: &[Tool]) -> Vec<String> {
        tools.iter().map(|t| t.name.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_tools() {
        let launcher = FakeLauncher::new();
        launcher.set("echo", Behavior::Tools(vec![tool("ping", &[])]));
        let sup = supervisor(&launcher);

        sup.add_service(service("echo")).await;
        sup.wait_for_connected("echo", WAIT).await.unwrap();

        assert_eq!(
            sup.status("echo").unwrap().state,
            ConnectionState::Connected { tool_count: 1 }
        );
        assert_eq!(
            tool_names(&sup.inner.registry.list_tools().await),
            vec!["ping"]
        );
        assert_eq!(sup.inner.index.len(), 1);

        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_service_never_attempted() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);

        let mut config = service("off");
        config.enabled = false;
        sup.add_service(config).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(sup.status("off").is_none());
        assert_eq!(launcher.opens("off"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_max_attempts() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("bad")).await;

        let mut waits = Vec::new();
        loop {
            match expect(&mut rx, |e| e.name() == "bad").await {
                ServiceEvent::Failed {
                    retry_in_ms: Some(ms),
                    ..
                } => waits.push(ms),
                ServiceEvent::RetriesExhausted { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(launcher.opens("bad"), 3);
        assert_eq!(waits, vec![1000, 2000]);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));

        let status = sup.status("bad").unwrap();
        assert!(matches!(
            status.state,
            ConnectionState::Error {
                exhausted: true,
                attempt: 3,
                ..
            }
        ));
        assert!(matches!(
            sup.wait_for_connected("bad", WAIT).await,
            Err(Error::RetriesExhausted { attempts: 3, .. })
        ));

        // Terminal: no further attempts
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.opens("bad"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped_at_sixty_seconds() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let settings = SupervisorSettings {
            max_retries: 9,
            retry_delay: Duration::from_secs(1),
            ..SupervisorSettings::default()
        };
        let sup = supervisor_with(&launcher, settings);
        let mut rx = sup.subscribe();

        sup.add_service(service("bad")).await;

        let mut waits = Vec::new();
        loop {
            match expect(&mut rx, |_| true).await {
                ServiceEvent::Failed {
                    retry_in_ms: Some(ms),
                    ..
                } => waits.push(ms),
                ServiceEvent::RetriesExhausted { .. } => break,
                _ => {}
            }
        }
        assert_eq!(
            waits,
            vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_retries_means_one_attempt() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let settings = SupervisorSettings {
            max_retries: 0,
            ..SupervisorSettings::default()
        };
        let sup = supervisor_with(&launcher, settings);
        let mut rx = sup.subscribe();

        sup.add_service(service("bad")).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::RetriesExhausted { .. })).await;
        assert_eq!(launcher.opens("bad"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_when_disabled_for_service() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        let mut config = service("bad");
        config.retry_on_failure = false;
        sup.add_service(config).await;

        let event = expect(&mut rx, |e| matches!(e, ServiceEvent::Failed { .. })).await;
        assert!(matches!(event, ServiceEvent::Failed { retry_in_ms: None, .. }));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.opens("bad"), 1);
        assert!(matches!(
            sup.status("bad").unwrap().state,
            ConnectionState::Error {
                exhausted: false,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let launcher = FakeLauncher::new();
        launcher.set("flaky", Behavior::FailLaunch);
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("flaky")).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Failed { .. })).await;
        launcher.set("flaky", Behavior::Tools(vec![tool("a", &[])]));

        let event = expect(&mut rx, |e| matches!(e, ServiceEvent::Connected { .. })).await;
        assert_eq!(
            event,
            ServiceEvent::Connected {
                name: "flaky".into(),
                tool_count: 1
            }
        );
        assert_eq!(launcher.opens("flaky"), 2);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_initialized_listing_recovers_during_connect() {
        let launcher = FakeLauncher::new();
        launcher.set("slow", Behavior::NotInitializedOnce(vec![tool("a", &[])]));
        let sup = supervisor(&launcher);

        sup.add_service(service("slow")).await;
        sup.wait_for_connected("slow", WAIT).await.unwrap();
        assert_eq!(launcher.opens("slow"), 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_keeps_single_connection() {
        let launcher = FakeLauncher::new();
        launcher.set("echo", Behavior::Tools(vec![tool("ping", &[])]));
        let sup = supervisor(&launcher);

        sup.add_service(service("echo")).await;
        sup.wait_for_connected("echo", WAIT).await.unwrap();
        sup.add_service(service("echo")).await;
        sup.wait_for_connected("echo", WAIT).await.unwrap();

        assert_eq!(launcher.opens("echo"), 2);
        assert_eq!(launcher.live("echo"), 1);
        assert_eq!(sup.inner.registry.remote_count("echo").await, 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_cancels_pending_retry() {
        let launcher = FakeLauncher::new();
        launcher.set("svc", Behavior::FailLaunch);
        let settings = SupervisorSettings {
            max_retries: 5,
            retry_delay: Duration::from_secs(30),
            ..SupervisorSettings::default()
        };
        let sup = supervisor_with(&launcher, settings);
        let mut rx = sup.subscribe();

        sup.add_service(service("svc")).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Failed { .. })).await;

        launcher.set("svc", Behavior::Tools(vec![]));
        sup.add_service(service("svc")).await;
        sup.wait_for_connected("svc", WAIT).await.unwrap();

        // The old retry would have fired 30s later
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(launcher.opens("svc"), 2);
        assert_eq!(launcher.live("svc"), 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_unregisters_and_closes() {
        let launcher = FakeLauncher::new();
        launcher.set("echo", Behavior::Tools(vec![tool("ping", &[])]));
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("echo")).await;
        sup.wait_for_connected("echo", WAIT).await.unwrap();

        assert!(sup.remove_service("echo").await);
        expect(&mut rx, |e| matches!(e, ServiceEvent::Removed { .. })).await;

        assert_eq!(
            sup.status("echo").unwrap().state,
            ConnectionState::Disconnected
        );
        assert!(sup.inner.registry.list_tools().await.is_empty());
        assert!(sup.inner.index.is_empty());
        assert_eq!(launcher.live("echo"), 0);
        assert!(sup.client("echo").is_none());

        assert!(!sup.remove_service("echo").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_during_handshake_does_not_leak() {
        let launcher = FakeLauncher::new();
        launcher.set("stuck", Behavior::Hang);
        let sup = supervisor(&launcher);

        sup.add_service(service("stuck")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(launcher.opens("stuck"), 1);

        sup.remove_service("stuck").await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.opens("stuck"), 1);
        assert_eq!(launcher.live("stuck"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_detects_exit_and_reconnects() {
        let launcher = FakeLauncher::new();
        launcher.set("svc", Behavior::Tools(vec![tool("a", &[])]));
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("svc")).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Connected { .. })).await;

        launcher.kill("svc");
        let started = tokio::time::Instant::now();
        expect(&mut rx, |e| matches!(e, ServiceEvent::ConnectionLost { .. })).await;
        assert!(started.elapsed() <= Duration::from_secs(30));

        expect(&mut rx, |e| matches!(e, ServiceEvent::Reconnecting { .. })).await;
        let event = expect(&mut rx, |e| matches!(e, ServiceEvent::Reconnected { .. })).await;
        assert_eq!(
            event,
            ServiceEvent::Reconnected {
                name: "svc".into(),
                tool_count: 1
            }
        );
        assert!(sup.is_connected("svc"));
        assert_eq!(launcher.opens("svc"), 2);
        assert_eq!(launcher.live("svc"), 1);
        assert_eq!(sup.inner.registry.remote_count("svc").await, 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_does_not_enter_backoff() {
        let launcher = FakeLauncher::new();
        launcher.set("svc", Behavior::Tools(vec![tool("a", &[])]));
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("svc")).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Connected { .. })).await;

        launcher.set("svc", Behavior::FailLaunch);
        launcher.kill("svc");
        expect(&mut rx, |e| matches!(e, ServiceEvent::ConnectionLost { .. })).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Reconnecting { .. })).await;

        // Next reconnect happens one liveness interval later, not on a backoff schedule
        let before = tokio::time::Instant::now();
        expect(&mut rx, |e| matches!(e, ServiceEvent::Reconnecting { .. })).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
        assert!(rx.try_recv().is_none());
        assert!(sup.inner.registry.list_tools().await.is_empty());

        launcher.set("svc", Behavior::Tools(vec![tool("a", &[])]));
        expect(&mut rx, |e| matches!(e, ServiceEvent::Reconnected { .. })).await;
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_without_auto_reconnect() {
        let launcher = FakeLauncher::new();
        launcher.set("svc", Behavior::Tools(vec![tool("a", &[])]));
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        let mut config = service("svc");
        config.auto_reconnect = false;
        sup.add_service(config).await;
        expect(&mut rx, |e| matches!(e, ServiceEvent::Connected { .. })).await;

        launcher.kill("svc");
        expect(&mut rx, |e| matches!(e, ServiceEvent::ConnectionLost { .. })).await;
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(launcher.opens("svc"), 1);
        assert_eq!(sup.status("svc").unwrap().last_error(), Some("connection lost"));
        assert!(sup.inner.registry.list_tools().await.is_empty());

        // A refresh does not bring it back behind the monitor's back
        assert!(matches!(
            sup.refresh_tools("svc").await,
            Err(Error::ServiceNotConnected(_))
        ));
        assert_eq!(launcher.opens("svc"), 1);
        assert_eq!(sup.status("svc").unwrap().state.as_str(), "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_diff() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);

        let old = vec![service("keep"), service("change"), service("drop")];
        for config in &old {
            sup.add_service(config.clone()).await;
        }
        for config in &old {
            sup.wait_for_connected(&config.name, WAIT).await.unwrap();
        }

        let mut changed = service("change");
        changed.args = vec!["--verbose".into()];
        let new = vec![service("keep"), changed, service("fresh")];

        let report = sup.reconcile(&old, &new).await;
        assert_eq!(report.unchanged, vec!["keep"]);
        assert_eq!(report.started, vec!["change", "fresh"]);
        assert_eq!(report.removed, vec!["drop"]);

        sup.wait_for_connected("fresh", WAIT).await.unwrap();
        sup.wait_for_connected("change", WAIT).await.unwrap();
        assert_eq!(launcher.opens("keep"), 1);
        assert_eq!(launcher.opens("change"), 2);
        assert_eq!(launcher.live("change"), 1);
        assert_eq!(launcher.live("drop"), 0);
        assert_eq!(
            sup.status("drop").unwrap().state,
            ConnectionState::Disconnected
        );
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_disable_removes() {
        let launcher = FakeLauncher::new();
        let sup = supervisor(&launcher);

        let old = vec![service("svc")];
        sup.add_service(service("svc")).await;
        sup.wait_for_connected("svc", WAIT).await.unwrap();

        let mut disabled = service("svc");
        disabled.enabled = false;
        let report = sup.reconcile(&old, &[disabled]).await;

        assert_eq!(report.removed, vec!["svc"]);
        assert_eq!(launcher.live("svc"), 0);
        assert!(!sup.is_connected("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_removes_everything() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let sup = supervisor(&launcher);

        sup.add_service(service("a")).await;
        sup.add_service(service("bad")).await;
        sup.wait_for_connected("a", WAIT).await.unwrap();

        sup.shutdown().await;
        assert_eq!(launcher.live("a"), 0);
        assert!(sup
            .statuses()
            .iter()
            .all(|s| s.state == ConnectionState::Disconnected));

        let opens = launcher.opens("bad");
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.opens("bad"), opens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_routes_and_rejects_unknown() {
        let launcher = FakeLauncher::new();
        launcher.set("weather", Behavior::Tools(vec![tool("forecast", &["city"])]));
        let sup = supervisor(&launcher);

        sup.add_service(service("weather").with_prefix("w")).await;
        sup.wait_for_connected("weather", WAIT).await.unwrap();

        let mut args = JsonObject::new();
        args.insert("city".into(), "Oslo".into());
        let result = sup.invoke("weather", "forecast", args).await.unwrap();
        assert_eq!(
            result.content[0].as_text().unwrap().text,
            r#"forecast:{"city":"Oslo"}"#
        );

        let err = sup
            .invoke("ghost", "x", JsonObject::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotConnected(_)));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_tools() {
        let launcher = FakeLauncher::new();
        launcher.set("svc", Behavior::Tools(vec![tool("a", &[])]));
        let sup = supervisor(&launcher);
        let mut rx = sup.subscribe();

        sup.add_service(service("svc")).await;
        sup.wait_for_connected("svc", WAIT).await.unwrap();

        assert_eq!(sup.refresh_tools("svc").await.unwrap(), 1);
        expect(&mut rx, |e| matches!(e, ServiceEvent::ToolsRefreshed { .. })).await;
        let session = &launcher.sessions("svc")[0];
        assert_eq!(
            session.list_calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );

        assert!(matches!(
            sup.refresh_tools("ghost").await,
            Err(Error::ServiceNotConnected(_))
        ));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_leaves_exhausted_service_alone() {
        let launcher = FakeLauncher::new();
        launcher.set("bad", Behavior::FailLaunch);
        let sup = supervisor(&launcher);

        sup.add_service(service("bad")).await;
        assert!(matches!(
            sup.wait_for_connected("bad", WAIT).await,
            Err(Error::RetriesExhausted { .. })
        ));
        assert_eq!(launcher.opens("bad"), 3);

        // Even once the service would come up, only an add revives it
        launcher.set("bad", Behavior::Tools(vec![tool("a", &[])]));
        assert!(matches!(
            sup.refresh_tools("bad").await,
            Err(Error::ServiceNotConnected(_))
        ));
        assert_eq!(launcher.opens("bad"), 3);
        assert!(matches!(
            sup.status("bad").unwrap().state,
            ConnectionState::Error { exhausted: true, .. }
        ));
        assert!(sup.inner.registry.list_tools().await.is_empty());
        assert_eq!(sup.inner.index.len(), 0);

        sup.add_service(service("bad")).await;
        sup.wait_for_connected("bad", WAIT).await.unwrap();
        assert_eq!(sup.refresh_tools("bad").await.unwrap(), 1);
        sup.shutdown().await;
    }

    #[test]
    fn test_state_names_and_serialization() {
        assert_eq!(ConnectionState::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");

        let status = ServiceStatus {
            name: "svc".into(),
            state: ConnectionState::Connected { tool_count: 4 },
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "connected");
        assert_eq!(value["tool_count"], 4);
        assert_eq!(status.tool_count(), 4);
        assert!(status.last_error().is_none());
    }

    #[test]
    fn test_settings_from_global() {
        let global = GlobalConfig {
            max_retries: 7,
            retry_delay: 2,
            liveness_interval: 0,
            ..GlobalConfig::default()
        };
        let settings = SupervisorSettings::from(&global);
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.retry_delay, Duration::from_secs(2));
        assert_eq!(settings.liveness_interval, Duration::from_secs(1));
    }
}
