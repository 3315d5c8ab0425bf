//! Registry cache: remote tool-server listings cached in SQLite.
//!
//! - `database`: the rusqlite tables and queries
//! - `manager`: `CacheManager`, the degrade-never-throw cache facade
//! - `sync`: registry sources, listing normalisation and the sync service

pub mod database;
pub mod errors;
pub mod manager;
pub mod sync;
pub mod types;

pub use errors::{CacheError, SyncError};
pub use manager::{CacheManager, Clock};
pub use sync::{FetchOutcome, HttpRegistrySource, RegistrySource, RegistrySyncService, SyncOutcome};
pub use types::{
    BulkWriteSummary, CacheStats, CachedServerRecord, InstallCommand, RegistrySyncStatus,
    SearchOptions, SearchResult, SortBy, SortOrder, SyncDetails, SyncState,
};
