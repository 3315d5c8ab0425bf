//! Hub settings: the single source of truth for tunable constants.
//!
//! Every timeout, concurrency ceiling and cache TTL used by the connection
//! and cache layers is read from `toolhub.yaml` (or its defaults).

pub mod config;
pub mod errors;

pub use config::{
    CacheSettings, ConcurrencySettings, ConnectionTimeouts, HubSettings, RegistrySourceConfig,
    ValidationSettings,
};
pub use errors::SettingsError;
