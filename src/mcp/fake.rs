//! In-memory launcher and session for driving the supervisor in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde_json::{json, Value};

use super::session::{LaunchSpec, Launcher, Session};
use crate::error::{Error, Result};

/// Tool with a string property per required name.
pub(crate) fn tool(name: &str, required: &[&str]) -> Tool {
    let properties: serde_json::Map<String, Value> = required
        .iter()
        .map(|p| (p.to_string(), json!({"type": "string", "description": format!("the {p}")})))
        .collect();
    let schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });
    let schema = match schema {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    };
    Tool::new(name.to_string(), format!("{name} tool"), Arc::new(schema))
}

#[derive(Clone)]
pub(crate) enum Behavior {
    Tools(Vec<Tool>),
    FailLaunch,
    /// Handshake never completes
    Hang,
    /// First listing is rejected until the client re-initializes
    NotInitializedOnce(Vec<Tool>),
    /// Every listing is rejected as not initialized
    NeverInitialized,
}

pub(crate) struct FakeLauncher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    opens: Mutex<HashMap<String, usize>>,
    sessions: Mutex<HashMap<String, Vec<Arc<FakeSession>>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Behavior for subsequent opens of `service`.
    pub(crate) fn set(&self, service: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(service.to_string(), behavior);
    }

    /// Total open attempts, successful or not.
    pub(crate) fn opens(&self, service: &str) -> usize {
        self.opens.lock().unwrap().get(service).copied().unwrap_or(0)
    }

    /// Sessions still open right now.
    pub(crate) fn live(&self, service: &str) -> usize {
        self.sessions(service).iter().filter(|s| s.is_open()).count()
    }

    pub(crate) fn sessions(&self, service: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulate the subprocess exiting underneath its sessions.
    pub(crate) fn kill(&self, service: &str) {
        for session in self.sessions(service) {
            session.open.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn open(&self, spec: &LaunchSpec) -> Result<Arc<dyn Session>> {
        *self
            .opens
            .lock()
            .unwrap()
            .entry(spec.service.clone())
            .or_default() += 1;

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&spec.service)
            .cloned()
            .unwrap_or(Behavior::Tools(Vec::new()));

        let (tools, pending_init, never_init) = match behavior {
            Behavior::FailLaunch => {
                return Err(Error::LaunchFailure {
                    service: spec.service.clone(),
                    reason: "No such file or directory".into(),
                })
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Tools(tools) => (tools, false, false),
            Behavior::NotInitializedOnce(tools) => (tools, true, false),
            Behavior::NeverInitialized => (Vec::new(), true, true),
        };

        let session = Arc::new(FakeSession {
            service: spec.service.clone(),
            tools,
            open: AtomicBool::new(true),
            pending_init: AtomicBool::new(pending_init),
            never_init,
            list_calls: AtomicUsize::new(0),
            reinit_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        });
        self.sessions
            .lock()
            .unwrap()
            .entry(spec.service.clone())
            .or_default()
            .push(session.clone());
        Ok(session)
    }
}

pub(crate) struct FakeSession {
    service: String,
    tools: Vec<Tool>,
    open: AtomicBool,
    pending_init: AtomicBool,
    never_init: bool,
    pub(crate) list_calls: AtomicUsize,
    pub(crate) reinit_calls: AtomicUsize,
    pub(crate) calls: Mutex<Vec<(String, JsonObject)>>,
}

impl FakeSession {
    fn closed(&self) -> Error {
        Error::ConnectionClosed(self.service.clone())
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        if !self.is_open() {
            return Err(self.closed());
        }
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.pending_init.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized {
                service: self.service.clone(),
                message: "Received request before initialization was complete".into(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: JsonObject) -> Result<CallToolResult> {
        if !self.is_open() {
            return Err(self.closed());
        }
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        match name {
            "hang" => std::future::pending::<()>().await,
            "fail" => return Ok(CallToolResult::error(vec![Content::text("upstream refused")])),
            _ => {}
        }
        let text = format!("{}:{}", name, Value::Object(arguments));
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    async fn reinitialize(&self) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed());
        }
        self.reinit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.never_init {
            self.pending_init.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
