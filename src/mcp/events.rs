//! Service lifecycle events for status broadcasting.
//!
//! Uses `tokio::sync::broadcast` for multiple subscribers (admin API, logs, tests).
//! Events are cheap to clone and carry enough context for display.

use tokio::sync::broadcast;

/// Service lifecycle event.
///
/// Emitted by the `Supervisor` on every state change of a service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// Connection attempt started (attempt 1 is the initial connect).
    Connecting { name: String, attempt: u32 },

    /// Handshake and initial tool listing succeeded.
    Connected { name: String, tool_count: usize },

    /// Attempt failed. `retry_in_ms` is set when another attempt is scheduled.
    Failed {
        name: String,
        attempt: u32,
        error: String,
        retry_in_ms: Option<u64>,
    },

    /// Retry ceiling reached; only an explicit add leaves this state.
    RetriesExhausted { name: String, attempts: u32 },

    /// Liveness check found the session closed.
    ConnectionLost { name: String },

    /// Liveness-triggered reconnect attempt started.
    Reconnecting { name: String },

    /// Liveness-triggered reconnect succeeded.
    Reconnected { name: String, tool_count: usize },

    /// Tools re-listed on demand.
    ToolsRefreshed { name: String, tool_count: usize },

    /// Service removed, disabled, or shut down.
    Removed { name: String },
}

impl ServiceEvent {
    /// Get the service name from any event variant.
    pub fn name(&self) -> &str {
        match self {
            ServiceEvent::Connecting { name, .. }
            | ServiceEvent::Connected { name, .. }
            | ServiceEvent::Failed { name, .. }
            | ServiceEvent::RetriesExhausted { name, .. }
            | ServiceEvent::ConnectionLost { name }
            | ServiceEvent::Reconnecting { name }
            | ServiceEvent::Reconnected { name, .. }
            | ServiceEvent::ToolsRefreshed { name, .. }
            | ServiceEvent::Removed { name } => name,
        }
    }

    /// Returns true for failure-shaped events.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ServiceEvent::Failed { .. }
                | ServiceEvent::RetriesExhausted { .. }
                | ServiceEvent::ConnectionLost { .. }
        )
    }
}

/// Broadcast sender for service events.
///
/// Sending to zero receivers silently succeeds.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Receiver for service events.
///
/// A lagged receiver misses events but never blocks the sender.
pub struct EventReceiver {
    rx: broadcast::Receiver<ServiceEvent>,
}

impl EventReceiver {
    /// Receive the next event. `None` once the sender is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<ServiceEvent>
    where
        F: FnMut(&ServiceEvent) -> bool,
    {
        while let Some(event) = self.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }
}
