//! One subprocess connection per service.
//!
//! Owns at most one live [`Session`] at a time. Opening is serialized so
//! concurrent first-use callers share a single spawn.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::session::{LaunchSpec, Launcher, Session};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};

/// Floor for ordinary launchers
const BASE_TIMEOUT_SECS: u64 = 60;
/// Interpreted-runtime launchers that may download packages first
const NPX_TIMEOUT_SECS: u64 = 90;
/// Package-fetch-and-run from a git source
const UVX_GIT_TIMEOUT_SECS: u64 = 180;

/// Handshake deadline for a service, tiered by how it is launched.
///
/// Cold start ranges from milliseconds for a local binary to minutes for a
/// `uvx git+...` fetch, so one global value would either kill slow services
/// or make fast ones slow to fail.
pub fn effective_timeout(config: &ServiceConfig) -> Duration {
    let full_command = std::iter::once(config.command.as_str())
        .chain(config.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    let floor = if config.command.contains("uvx") && full_command.contains("git+") {
        UVX_GIT_TIMEOUT_SECS
    } else if config.command.contains("npx") {
        NPX_TIMEOUT_SECS
    } else {
        BASE_TIMEOUT_SECS
    };

    Duration::from_secs(config.timeout.max(floor))
}

pub struct Connection {
    spec: LaunchSpec,
    launcher: Arc<dyn Launcher>,
    timeout: Duration,
    call_timeout: Duration,
    session: RwLock<Option<Arc<dyn Session>>>,
    open_lock: tokio::sync::Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(config: &ServiceConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            spec: LaunchSpec::from(config),
            launcher,
            timeout: effective_timeout(config),
            call_timeout: config.call_timeout(),
            session: RwLock::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            last_error: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.spec.service
    }

    /// Deadline for spawn + handshake and for tool listing.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deadline for a single tool call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_open())
    }

    /// The open session, or `ConnectionClosed` when there is none.
    pub fn session(&self) -> Result<Arc<dyn Session>> {
        match self.current() {
            Some(session) if session.is_open() => Ok(session),
            _ => Err(Error::ConnectionClosed(self.spec.service.clone())),
        }
    }

    /// Return the live session, spawning and handshaking if needed.
    ///
    /// Fails with `HandshakeTimeout` when spawn plus initialize exceed the
    /// effective timeout. A stale session is closed before respawning.
    pub async fn open(&self) -> Result<Arc<dyn Session>> {
        let _guard = self.open_lock.lock().await;

        if let Ok(session) = self.session() {
            return Ok(session);
        }
        self.close_current().await;

        let result = match tokio::time::timeout(self.timeout, self.launcher.open(&self.spec)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout {
                service: self.spec.service.clone(),
                secs: self.timeout.as_secs(),
            }),
        };

        match result {
            Ok(session) => {
                *self.session.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(session.clone());
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                debug!(service = %self.spec.service, "connection established");
                Ok(session)
            }
            Err(e) => {
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Release the session and its process. Safe to call repeatedly.
    pub async fn close(&self) {
        let _guard = self.open_lock.lock().await;
        self.close_current().await;
    }

    /// Drop a session that reported itself closed mid-request.
    pub async fn mark_closed(&self, err: &Error) {
        warn!(service = %self.spec.service, error = %err, "connection unusable, cleaning up");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        self.close_current().await;
    }

    fn current(&self) -> Option<Arc<dyn Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn close_current(&self) {
        let taken = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = taken {
            session.close().await;
        }
    }
}
