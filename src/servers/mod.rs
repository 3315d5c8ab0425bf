//! Tool-server configuration: data model, health, durable store, validation.

pub mod errors;
pub mod health;
pub mod store;
pub mod types;
pub mod validator;

pub use errors::ConfigError;
pub use health::ConnectionHealth;
pub use store::ConfigStore;
pub use types::{
    CustomSettings, FilesystemSettings, GithubSettings, PostgresSettings, ServerConfig,
    ServerKind, ServerSettings, ServerStatus, SqliteSettings, ToolDefinition,
};
pub use validator::{
    ConfigValidator, ValidationCode, ValidationError, ValidationResult, ValidationWarning,
};
