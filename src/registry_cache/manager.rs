//! Read-through / write-through cache over [`RegistryDatabase`].
//!
//! Every storage failure is logged and degraded: writes become no-ops and
//! reads return empty results, so an unavailable store never reaches the
//! caller as an error.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::database::{RegistryDatabase, SyncRowUpdate, SEARCH_OPERATION};
use super::errors::CacheError;
use super::types::{
    BulkWriteSummary, CacheStats, CachedServerRecord, PerformanceMetric, RegistrySyncStatus,
    SearchOptions, SearchResult, SyncDetails, SyncState,
};
use crate::settings::CacheSettings;

/// Source of "now". Injectable so expiry can be tested.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct CacheManager {
    db: Option<Mutex<RegistryDatabase>>,
    settings: CacheSettings,
    clock: Clock,
}

impl CacheManager {
    /// Open the cache at `path`, degrading to an unavailable cache on error.
    pub fn open(path: &Path, settings: CacheSettings) -> Self {
        match RegistryDatabase::open(path) {
            Ok(db) => {
                tracing::info!(path = %path.display(), "registry cache opened");
                Self::with_database(Some(db), settings)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "registry cache unavailable");
                Self::with_database(None, settings)
            }
        }
    }

    pub fn in_memory(settings: CacheSettings) -> Self {
        let db = RegistryDatabase::open_in_memory()
            .map_err(|e| tracing::warn!(error = %e, "in-memory registry cache unavailable"))
            .ok();
        Self::with_database(db, settings)
    }

    /// A cache with no backing store.
    pub fn unavailable(settings: CacheSettings) -> Self {
        Self::with_database(None, settings)
    }

    fn with_database(db: Option<RegistryDatabase>, settings: CacheSettings) -> Self {
        Self {
            db: db.map(Mutex::new),
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn db(&self) -> Option<MutexGuard<'_, RegistryDatabase>> {
        self.db
            .as_ref()
            .map(|db| db.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ─── Search ─────────────────────────────────────────────────────────

    /// Search cached records, serving repeated searches from the search cache.
    pub fn search_servers(&self, options: &SearchOptions) -> SearchResult {
        let started = Instant::now();
        let Some(db) = self.db() else {
            tracing::warn!("registry cache unavailable, search returns nothing");
            return SearchResult::default();
        };

        let normalized = options.normalized();
        let key = normalized.cache_key();
        let now = self.now().timestamp_millis();

        match db.take_search_entry(&key, now) {
            Ok(Some(entry)) => match db.get_servers(&entry.result_ids) {
                Ok(mut servers) => {
                    mark_stale(&db, &mut servers);
                    let result = SearchResult {
                        total: entry.total,
                        has_more: entry.has_more,
                        servers,
                        from_cache: true,
                    };
                    self.record(&db, SEARCH_OPERATION, started, true, result.servers.len(), 0);
                    return result;
                }
                Err(e) => tracing::warn!(error = %e, "failed to resolve cached search results"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "search cache lookup failed"),
        }

        let (mut servers, total) = match db.query_servers(&normalized) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "registry search failed");
                self.record(&db, SEARCH_OPERATION, started, false, 0, 1);
                return SearchResult::default();
            }
        };
        mark_stale(&db, &mut servers);
        let has_more = normalized.offset + servers.len() < total;

        let ids: Vec<String> = servers.iter().map(|s| s.id.clone()).collect();
        let expires_at = now + ttl_millis(self.settings.search_ttl_secs);
        if let Err(e) = db.put_search_entry(&key, &ids, total, has_more, now, expires_at) {
            tracing::warn!(error = %e, "failed to store search cache entry");
        }
        match db.evict_search_entries(self.settings.max_search_entries, now) {
            Ok(0) => {}
            Ok(evicted) => tracing::debug!(evicted, "evicted search cache entries"),
            Err(e) => tracing::debug!(error = %e, "search cache eviction failed"),
        }

        self.record(&db, SEARCH_OPERATION, started, false, servers.len(), 0);
        SearchResult {
            servers,
            total,
            has_more,
            from_cache: false,
        }
    }

    /// Append a timing row. Failures only reach the debug log.
    fn record(
        &self,
        db: &RegistryDatabase,
        operation: &'static str,
        started: Instant,
        cache_hit: bool,
        result_count: usize,
        error_count: usize,
    ) {
        let metric = PerformanceMetric {
            operation,
            duration_ms: started.elapsed().as_millis() as u64,
            cache_hit,
            result_count,
            error_count,
        };
        if let Err(e) = db.record_metric(&metric, self.now().timestamp_millis()) {
            tracing::debug!(error = %e, "failed to record cache metric");
        }
    }

    // ─── Records ────────────────────────────────────────────────────────

    /// Upsert one record. Returns whether it was written.
    pub fn cache_server(&self, record: &CachedServerRecord) -> bool {
        let started = Instant::now();
        let Some(db) = self.db() else {
            tracing::warn!(id = %record.id, "registry cache unavailable, record not cached");
            return false;
        };
        let (written, errors) = match db.upsert_server(record, self.now().timestamp_millis()) {
            Ok(written) => (written, 0),
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "failed to cache server");
                (false, 1)
            }
        };
        self.record(&db, "cache_server", started, false, usize::from(written), errors);
        written
    }

    /// Upsert `records` atomically; package-name conflicts are skipped.
    pub fn bulk_cache_servers(&self, records: &[CachedServerRecord]) -> BulkWriteSummary {
        self.try_bulk_cache_servers(records).unwrap_or_else(|e| {
            tracing::warn!(count = records.len(), error = %e, "bulk cache write dropped");
            BulkWriteSummary::default()
        })
    }

    /// Like [`bulk_cache_servers`](Self::bulk_cache_servers), but reports a
    /// missing store or a rolled-back transaction to the caller.
    pub fn try_bulk_cache_servers(
        &self,
        records: &[CachedServerRecord],
    ) -> Result<BulkWriteSummary, CacheError> {
        let started = Instant::now();
        let mut db = self.db().ok_or(CacheError::Unavailable)?;
        let result = db.upsert_servers(records, self.now().timestamp_millis());
        match &result {
            Ok(summary) => {
                tracing::debug!(
                    written = summary.written,
                    skipped = summary.skipped,
                    "bulk cached servers"
                );
                self.record(&db, "bulk_cache_servers", started, false, summary.written, 0);
            }
            Err(_) => self.record(&db, "bulk_cache_servers", started, false, 0, 1),
        }
        result
    }

    pub fn get_server(&self, id: &str) -> Option<CachedServerRecord> {
        let started = Instant::now();
        let db = self.db()?;
        let found = match db.get_server(id) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(id, error = %e, "failed to read cached server");
                self.record(&db, "get_server", started, false, 0, 1);
                return None;
            }
        };
        let mut found: Vec<CachedServerRecord> = found.into_iter().collect();
        mark_stale(&db, &mut found);
        self.record(&db, "get_server", started, !found.is_empty(), found.len(), 0);
        found.pop()
    }

    /// Number of timing rows recorded for `operation`.
    pub fn metric_count(&self, operation: &str) -> usize {
        let Some(db) = self.db() else {
            return 0;
        };
        db.count_metrics(operation).unwrap_or_else(|e| {
            tracing::debug!(operation, error = %e, "failed to count cache metrics");
            0
        })
    }

    // ─── Registry sync ──────────────────────────────────────────────────

    /// Whether `registry` last synced successfully less than `max_age` ago.
    pub fn is_registry_fresh(&self, registry: &str, max_age: Duration) -> bool {
        let Some(last_success) = self
            .get_registry_sync(registry)
            .and_then(|s| s.last_success_at)
        else {
            return false;
        };
        let age = self.now().signed_duration_since(last_success);
        chrono::Duration::from_std(max_age).is_ok_and(|max| age < max)
    }

    /// Record a sync state change and schedule the next sync.
    pub fn update_registry_sync(&self, registry: &str, status: SyncState, details: SyncDetails) {
        let started = Instant::now();
        let Some(db) = self.db() else {
            tracing::warn!(registry, "registry cache unavailable, sync status not recorded");
            return;
        };
        let now = self.now().timestamp_millis();
        let mut update = SyncRowUpdate {
            last_sync_at: Some(now),
            duration_ms: details.duration_ms,
            ..SyncRowUpdate::default()
        };
        match status {
            SyncState::Success => {
                update.last_success_at = Some(now);
                update.server_count = details.server_count;
                update.etag = details.etag;
                update.next_sync_at =
                    Some(now + ttl_millis(self.settings.sync_success_interval_secs));
            }
            SyncState::Error => {
                update.error_message = details.error_message;
                update.next_sync_at = Some(now + ttl_millis(self.settings.sync_retry_interval_secs));
            }
            SyncState::Pending | SyncState::Syncing => {}
        }
        let errors = match db.upsert_sync(registry, status, &update) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(registry, error = %e, "failed to record registry sync");
                1
            }
        };
        self.record(&db, "update_registry_sync", started, false, 1 - errors, errors);
    }

    pub fn get_registry_sync(&self, registry: &str) -> Option<RegistrySyncStatus> {
        let db = self.db()?;
        db.get_sync(registry)
            .map_err(|e| tracing::warn!(registry, error = %e, "failed to read registry sync"))
            .ok()
            .flatten()
    }

    pub fn list_registry_syncs(&self) -> Vec<RegistrySyncStatus> {
        let Some(db) = self.db() else {
            return Vec::new();
        };
        db.list_syncs().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to list registry syncs");
            Vec::new()
        })
    }

    /// Remove every record of `registry` and invalidate all cached searches.
    pub fn clear_registry_cache(&self, registry: &str) -> usize {
        let started = Instant::now();
        let Some(db) = self.db() else {
            tracing::warn!(registry, "registry cache unavailable, nothing cleared");
            return 0;
        };
        let mut errors = 0;
        let removed = db.delete_registry(registry).unwrap_or_else(|e| {
            tracing::warn!(registry, error = %e, "failed to clear registry records");
            errors += 1;
            0
        });
        if let Err(e) = db.clear_search_cache() {
            tracing::warn!(error = %e, "failed to clear search cache");
            errors += 1;
        }
        self.record(&db, "clear_registry_cache", started, false, removed, errors);
        tracing::info!(registry, removed, "registry cache cleared");
        removed
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let Some(db) = self.db() else {
            return CacheStats::default();
        };
        db.stats().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to aggregate cache stats");
            CacheStats::default()
        })
    }
}

/// Flag records whose registry's latest sync failed.
fn mark_stale(db: &RegistryDatabase, records: &mut [CachedServerRecord]) {
    if records.is_empty() {
        return;
    }
    let failing: HashSet<String> = match db.list_syncs() {
        Ok(syncs) => syncs
            .into_iter()
            .filter(|s| s.status == SyncState::Error)
            .map(|s| s.registry)
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to read sync state for staleness");
            return;
        }
    };
    for record in records {
        record.metrics_stale = failing.contains(&record.registry);
    }
}

fn ttl_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX / 2)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
