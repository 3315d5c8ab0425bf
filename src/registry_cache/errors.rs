//! Registry cache error types.

use thiserror::Error;

/// Errors from the relational cache store.
///
/// `CacheManager` degrades these to empty results; they surface only from
/// `RegistryDatabase`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("registry database error: {reason}")]
    Database { reason: String },

    #[error("failed to (de)serialize cached record: {reason}")]
    Serialization { reason: String },

    #[error("failed to prepare cache directory {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("registry cache storage is unavailable")]
    Unavailable,
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Database {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Errors fetching a remote registry listing.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("registry '{registry}' request failed: {reason}")]
    Http { registry: String, reason: String },

    #[error("registry '{registry}' returned HTTP {status}")]
    Status { registry: String, status: u16 },

    #[error("registry '{registry}' returned an unreadable listing: {reason}")]
    Decode { registry: String, reason: String },
}
