//! Config-store error types.

use thiserror::Error;

/// Errors raised by the durable server-config store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The store file could not be read or written.
    #[error("config store I/O error at {path}: {reason}")]
    Io { path: String, reason: String },

    /// The store document is not a valid server list.
    #[error("failed to parse server configs: {reason}")]
    Parse { reason: String },

    /// No server with the given id exists.
    #[error("server not found: '{id}'")]
    NotFound { id: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse {
            reason: e.to_string(),
        }
    }
}
