//! Settings error types.

use thiserror::Error;

/// Errors that can occur while locating or parsing `toolhub.yaml`.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// The settings file is not valid YAML for `HubSettings`.
    #[error("failed to parse settings: {reason}")]
    ParseFailed { reason: String },

    /// No settings file was found in any search location.
    #[error("settings file not found: {reason}")]
    NotFound { reason: String },
}
