//! MCP client error types.

use thiserror::Error;

/// Errors raised inside the process and protocol layer.
///
/// These never escape `ServerConnectionManager::connect`; they are folded
/// into `ConnectResult` and the server's health record.
#[derive(Debug, Error)]
pub enum McpError {
    /// Blocking validation errors; no process was spawned.
    #[error("configuration for '{server}' is invalid: {reason}")]
    InvalidConfig { server: String, reason: String },

    /// No config with this id exists.
    #[error("unknown server: '{server}'")]
    UnknownServer { server: String },

    /// The server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    /// The initialize / tools-list exchange failed.
    #[error("server '{server}' handshake failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// Framing or I/O error on the stdio pipes.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// An operation exceeded its ceiling.
    #[error("server '{server}' timed out after {timeout_ms}ms during {phase}")]
    Timeout {
        server: String,
        phase: String,
        timeout_ms: u64,
    },

    /// The server process exited while connected.
    #[error("server '{server}' exited: {reason}")]
    ProcessExited { server: String, reason: String },

    /// The connection was torn down by an explicit disconnect.
    #[error("server '{server}' was disconnected")]
    Disconnected { server: String },

    /// Persisting the updated config failed.
    #[error("failed to persist config for '{server}': {reason}")]
    StoreFailed { server: String, reason: String },
}
