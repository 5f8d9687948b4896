//! MCP Client error types.

use serde::Serialize;
use thiserror::Error;

use super::supervisor::ConnectionState;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// Stream-level I/O failure (write to stdin, serialization).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// A single inbound line was not a valid protocol message.
    #[error("malformed frame: {reason} (line: {line})")]
    MalformedFrame {
        reason: String,
        line: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the current catalog.
    #[error("Tool '{name}' not available. Available tools: {}", available.join(", "))]
    ToolUnavailable {
        name: String,
        available: Vec<String>,
    },

    /// Resource not present in the current catalog.
    #[error("Resource '{uri}' not available. Available resources: {}", available.join(", "))]
    ResourceUnavailable {
        uri: String,
        available: Vec<String>,
    },

    /// A request was issued while the session was not `Ready`.
    /// `known` lists the catalog names from the last discovery.
    #[error("MCP client not connected (state: {state}). Known names: {}", known.join(", "))]
    NotReady {
        state: ConnectionState,
        known: Vec<String>,
    },

    /// A request's deadline elapsed before its response arrived.
    #[error("MCP request timeout for method '{method}' after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The connection went away while the request was pending.
    #[error("MCP connection lost: {reason}")]
    ConnectionLost {
        reason: String,
    },

    /// `connect()` was called while another attempt owns the process slot.
    #[error("a connection attempt for server '{name}' is already in progress")]
    ConnectInProgress {
        name: String,
    },

    /// The session was explicitly disconnected and will not reconnect.
    #[error("MCP session for server '{name}' has been closed")]
    SessionClosed {
        name: String,
    },

    /// Configuration error (bad file, unsupported transport).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All reconnection attempts exhausted.
    #[error("server '{name}' failed after {attempts} reconnection attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

/// Coarse classification of an [`McpError`], carried in structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Spawn,
    Transport,
    Framing,
    Protocol,
    Unavailable,
    NotReady,
    Timeout,
    ConnectionLost,
    Config,
    Exhausted,
}

impl McpError {
    /// Classify this error for callers that branch on failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed { .. } => ErrorKind::Spawn,
            Self::InitFailed { .. } | Self::TransportError { .. } => ErrorKind::Transport,
            Self::MalformedFrame { .. } => ErrorKind::Framing,
            Self::ServerError { .. } => ErrorKind::Protocol,
            Self::ToolUnavailable { .. } | Self::ResourceUnavailable { .. } => {
                ErrorKind::Unavailable
            }
            Self::NotReady { .. } | Self::ConnectInProgress { .. } | Self::SessionClosed { .. } => {
                ErrorKind::NotReady
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::ConfigError { .. } => ErrorKind::Config,
            Self::RestartExhausted { .. } => ErrorKind::Exhausted,
        }
    }
}
