//! Registry cache data types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Results per page when the caller does not ask for a size.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Largest page a search may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// How to install a registry server as a custom tool server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A server listing cached from a remote registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedServerRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Unique among active records when present.
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub package_registry: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    /// Name of the registry this record came from.
    pub registry: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub install_count: Option<u64>,
    #[serde(default)]
    pub github_stars: Option<u64>,
    #[serde(default)]
    pub install_command: Option<InstallCommand>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Stamped by the cache on every write.
    #[serde(default)]
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Set on reads while the last sync of `registry` failed, so rating and
    /// install figures may be out of date. Never persisted.
    #[serde(default)]
    pub metrics_stale: bool,
}

fn default_active() -> bool {
    true
}

impl CachedServerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, registry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            author: None,
            package_name: None,
            package_registry: None,
            repository: None,
            registry: registry.into(),
            tags: Vec::new(),
            rating: None,
            install_count: None,
            github_stars: None,
            install_command: None,
            updated_at: Utc::now(),
            is_active: true,
            last_fetched_at: None,
            metrics_stale: false,
        }
    }

    /// Lower-cased concatenation of every searchable field.
    pub fn search_vector(&self) -> String {
        let mut parts: Vec<&str> = vec![self.name.as_str(), self.description.as_str()];
        parts.extend(self.author.as_deref());
        parts.extend(self.package_name.as_deref());
        parts.extend(self.tags.iter().map(String::as_str));
        parts.join(" ").to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    #[default]
    Name,
    Rating,
    InstallCount,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Parameters of a registry search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: None,
            tags: Vec::new(),
            author: None,
            registry: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl SearchOptions {
    /// Trimmed, lower-cased text fields, sorted de-duplicated tags and a
    /// clamped page size. Equivalent searches normalize identically.
    pub fn normalized(&self) -> SearchOptions {
        let text = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        };
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();

        SearchOptions {
            query: text(&self.query),
            tags,
            author: text(&self.author),
            registry: self
                .registry
                .as_deref()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            sort_by: self.sort_by,
            sort_order: self.sort_order,
            limit: match self.limit {
                0 => DEFAULT_PAGE_SIZE,
                n => n.min(MAX_PAGE_SIZE),
            },
            offset: self.offset,
        }
    }

    /// Stable hex hash of the normalized options.
    pub fn cache_key(&self) -> String {
        let normalized = self.normalized();
        let canonical = serde_json::to_string(&normalized).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub servers: Vec<CachedServerRecord>,
    pub total: usize,
    pub has_more: bool,
    pub from_cache: bool,
}

/// State of the last sync against one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Success,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Syncing => "syncing",
            SyncState::Success => "success",
            SyncState::Error => "error",
        }
    }

    pub fn parse(value: &str) -> SyncState {
        match value {
            "syncing" => SyncState::Syncing,
            "success" => SyncState::Success,
            "error" => SyncState::Error,
            _ => SyncState::Pending,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySyncStatus {
    pub registry: String,
    pub status: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub server_count: usize,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub sync_duration_ms: Option<u64>,
    /// Validator of the last full listing, sent back as `If-None-Match`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Extra facts recorded with a sync status change.
#[derive(Debug, Clone, Default)]
pub struct SyncDetails {
    pub server_count: Option<usize>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    /// `None` keeps the stored validator.
    pub etag: Option<String>,
}

/// Aggregate cache figures. All zero when storage is unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_servers: usize,
    pub servers_by_registry: BTreeMap<String, usize>,
    pub cache_entries: usize,
    pub average_response_time_ms: f64,
    /// Fraction of searches served from cache, in `[0, 1]`.
    pub cache_hit_rate: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// One timed cache operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetric {
    pub operation: &'static str,
    pub duration_ms: u64,
    pub cache_hit: bool,
    pub result_count: usize,
    pub error_count: usize,
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteSummary {
    pub written: usize,
    /// Records dropped because another id owns their package name.
    pub skipped: usize,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_searches_share_cache_key() {
        let a = SearchOptions {
            query: Some("  FileSystem ".into()),
            tags: vec!["Files".into(), "local".into()],
            ..SearchOptions::default()
        };
        let b = SearchOptions {
            query: Some("filesystem".into()),
            tags: vec!["local".into(), "files".into(), "local".into()],
            ..SearchOptions::default()
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 64);

        let c = SearchOptions {
            offset: 20,
            ..b
        };
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_limit_is_clamped() {
        let zero = SearchOptions {
            limit: 0,
            ..SearchOptions::default()
        };
        assert_eq!(zero.normalized().limit, DEFAULT_PAGE_SIZE);
        let huge = SearchOptions {
            limit: 10_000,
            ..SearchOptions::default()
        };
        assert_eq!(huge.normalized().limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_search_vector_covers_fields() {
        let mut record = CachedServerRecord::new("a", "Weather", "pulse");
        record.description = "Forecasts".into();
        record.package_name = Some("@acme/weather".into());
        record.tags = vec!["API".into()];
        assert_eq!(record.search_vector(), "weather forecasts @acme/weather api");
    }

    #[test]
    fn test_sync_state_parse() {
        assert_eq!(SyncState::parse("success"), SyncState::Success);
        assert_eq!(SyncState::parse("bogus"), SyncState::Pending);
        assert_eq!(SyncState::Error.to_string(), "error");
    }
}
