//! Error taxonomy for the gateway core.

use thiserror::Error;

/// Errors raised by sessions, the supervisor, the registry, and local commands.
#[derive(Error, Debug)]
pub enum Error {
    /// The subprocess could not be started.
    #[error("failed to launch '{service}': {reason}")]
    LaunchFailure { service: String, reason: String },

    /// Spawn or initialize exchange did not finish within the effective timeout.
    #[error("handshake with '{service}' timed out after {secs}s")]
    HandshakeTimeout { service: String, secs: u64 },

    /// The subprocess started but rejected or broke the initialize exchange.
    #[error("handshake with '{service}' failed: {reason}")]
    HandshakeFailed { service: String, reason: String },

    /// The subprocess reported a malformed or unsupported request shape.
    #[error("'{service}' rejected request: {message}")]
    ProtocolInvalidRequest { service: String, message: String },

    /// The subprocess refused a request because its own startup is unfinished.
    #[error("'{service}' is not initialized yet: {message}")]
    NotInitialized { service: String, message: String },

    /// Any other JSON-RPC level failure.
    #[error("protocol error from '{service}': {message}")]
    Protocol { service: String, message: String },

    /// Pipe or session closed, including after the subprocess exited.
    #[error("connection to '{0}' closed")]
    ConnectionClosed(String),

    /// A request on a live session exceeded its deadline.
    #[error("request to '{service}' timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("missing required parameters: {}", .0.join(", "))]
    MissingRequiredParameters(Vec<String>),

    #[error("'{service}' gave up after {attempts} attempts")]
    RetriesExhausted { service: String, attempts: u32 },

    #[error("service '{0}' is not connected")]
    ServiceNotConnected(String),

    #[error("local command '{name}' failed: {reason}")]
    LocalCommand { name: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True for the class of errors a service returns while its startup is
    /// still settling, which earns exactly one re-initialize attempt.
    pub fn is_not_initialized(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized { .. } | Error::ProtocolInvalidRequest { .. }
        )
    }

    /// True when the session behind the error can no longer be used.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
