//! SQLite store behind the registry cache.
//!
//! Uses `rusqlite` synchronously; callers hold it behind a mutex. Timestamps
//! are stored as epoch milliseconds. Each server row keeps the full record as
//! a JSON payload next to the columns used for filtering and sorting.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};

use super::errors::CacheError;
use super::types::{
    BulkWriteSummary, CacheStats, CachedServerRecord, PerformanceMetric, RegistrySyncStatus,
    SearchOptions, SortBy, SortOrder, SyncState,
};

/// Operation name under which searches are recorded.
pub const SEARCH_OPERATION: &str = "search_servers";

/// A cached page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCacheEntry {
    pub result_ids: Vec<String>,
    pub total: usize,
    pub has_more: bool,
    pub hit_count: u64,
}

/// Column values for a sync-row upsert. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SyncRowUpdate {
    pub last_sync_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub server_count: Option<usize>,
    pub next_sync_at: Option<i64>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub etag: Option<String>,
}

// ─── Database ───────────────────────────────────────────────────────────────

pub struct RegistryDatabase {
    conn: Connection,
}

impl RegistryDatabase {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self { conn };
        db.create_tables()?;
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database (tests).
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.create_tables()?;
        db.migrate()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), CacheError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS registry_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                author TEXT,
                package_name TEXT,
                registry TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                rating REAL,
                install_count INTEGER,
                updated_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_fetched_at INTEGER NOT NULL,
                search_vector TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_registry_servers_package
                ON registry_servers(package_name)
                WHERE package_name IS NOT NULL AND is_active = 1;

            CREATE INDEX IF NOT EXISTS idx_registry_servers_registry
                ON registry_servers(registry);

            CREATE TABLE IF NOT EXISTS search_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query_hash TEXT NOT NULL UNIQUE,
                result_ids TEXT NOT NULL,
                total INTEGER NOT NULL,
                has_more INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS registry_sync (
                registry TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_sync_at INTEGER,
                last_success_at INTEGER,
                server_count INTEGER NOT NULL DEFAULT 0,
                next_sync_at INTEGER,
                error_message TEXT,
                sync_duration_ms INTEGER,
                etag TEXT
            );

            CREATE TABLE IF NOT EXISTS performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                cache_hit INTEGER NOT NULL,
                result_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Columns added after the first release.
    fn migrate(&self) -> Result<(), CacheError> {
        let has_etag: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('registry_sync') WHERE name = 'etag'",
            [],
            |row| row.get(0),
        )?;
        if !has_etag {
            tracing::info!("adding etag column to registry_sync");
            self.conn
                .execute_batch("ALTER TABLE registry_sync ADD COLUMN etag TEXT")?;
        }
        Ok(())
    }

    // ─── Server records ─────────────────────────────────────────────────

    /// Upsert one record. Returns `false` when it was skipped because a
    /// different id owns its package name.
    pub fn upsert_server(&self, record: &CachedServerRecord, now: i64) -> Result<bool, CacheError> {
        upsert_record(&self.conn, record, now)
    }

    /// Upsert `records` in one transaction, first writer wins on package
    /// name conflicts (including conflicts inside the batch).
    pub fn upsert_servers(
        &mut self,
        records: &[CachedServerRecord],
        now: i64,
    ) -> Result<BulkWriteSummary, CacheError> {
        let tx = self.conn.transaction()?;
        let mut summary = BulkWriteSummary::default();
        for record in records {
            if upsert_record(&tx, record, now)? {
                summary.written += 1;
            } else {
                summary.skipped += 1;
            }
        }
        tx.commit()?;
        Ok(summary)
    }

    /// Active record by id.
    pub fn get_server(&self, id: &str) -> Result<Option<CachedServerRecord>, CacheError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM registry_servers WHERE id = ?1 AND is_active = 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(CacheError::from))
            .transpose()
    }

    /// Records for `ids` in the given order, skipping ids no longer cached.
    pub fn get_servers(&self, ids: &[String]) -> Result<Vec<CachedServerRecord>, CacheError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_server(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Run a search directly against the records. Returns the page and the
    /// total match count. `options` must already be normalized.
    pub fn query_servers(
        &self,
        options: &SearchOptions,
    ) -> Result<(Vec<CachedServerRecord>, usize), CacheError> {
        let mut clauses = vec!["is_active = 1".to_string()];
        let mut values: Vec<String> = Vec::new();

        if let Some(query) = &options.query {
            let pattern = like_pattern(query);
            clauses.push(
                "(lower(name) LIKE ? ESCAPE '\\' OR lower(description) LIKE ? ESCAPE '\\' \
                 OR search_vector LIKE ? ESCAPE '\\')"
                    .to_string(),
            );
            values.extend([pattern.clone(), pattern.clone(), pattern]);
        }
        if let Some(author) = &options.author {
            clauses.push("lower(author) = ?".to_string());
            values.push(author.clone());
        }
        if let Some(registry) = &options.registry {
            clauses.push("registry = ?".to_string());
            values.push(registry.clone());
        }
        for tag in &options.tags {
            // Tags are stored as a JSON array; match the quoted element.
            clauses.push("lower(tags) LIKE ? ESCAPE '\\'".to_string());
            values.push(format!("%\"{}\"%", escape_like(tag)));
        }
        let filter = clauses.join(" AND ");

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM registry_servers WHERE {filter}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let column = match options.sort_by {
            SortBy::Name => "lower(name)",
            SortBy::Rating => "rating",
            SortBy::InstallCount => "install_count",
            SortBy::UpdatedAt => "updated_at",
        };
        let direction = match options.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT payload FROM registry_servers WHERE {filter}
             ORDER BY {column} {direction}, id ASC LIMIT {} OFFSET {}",
            options.limit, options.offset
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let payloads = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let records = payloads
            .iter()
            .map(|p| serde_json::from_str(p))
            .collect::<Result<Vec<CachedServerRecord>, _>>()?;

        Ok((records, total.max(0) as usize))
    }

    /// Delete every record of `registry`. Returns the number removed.
    ///
    /// The stored validator goes too, so the next sync fetches a full listing.
    pub fn delete_registry(&self, registry: &str) -> Result<usize, CacheError> {
        let removed = self.conn.execute(
            "DELETE FROM registry_servers WHERE registry = ?1",
            params![registry],
        )?;
        self.conn.execute(
            "UPDATE registry_sync SET etag = NULL WHERE registry = ?1",
            params![registry],
        )?;
        Ok(removed)
    }

    // ─── Search cache ───────────────────────────────────────────────────

    /// Unexpired entry for `hash`, bumping its hit counter.
    pub fn take_search_entry(
        &self,
        hash: &str,
        now: i64,
    ) -> Result<Option<SearchCacheEntry>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT result_ids, total, has_more, hit_count FROM search_cache
                 WHERE query_hash = ?1 AND expires_at > ?2",
                params![hash, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((ids, total, has_more, hits)) = row else {
            return Ok(None);
        };
        self.conn.execute(
            "UPDATE search_cache SET hit_count = hit_count + 1 WHERE query_hash = ?1",
            params![hash],
        )?;
        Ok(Some(SearchCacheEntry {
            result_ids: serde_json::from_str(&ids)?,
            total: total.max(0) as usize,
            has_more,
            hit_count: hits.max(0) as u64 + 1,
        }))
    }

    pub fn put_search_entry(
        &self,
        hash: &str,
        result_ids: &[String],
        total: usize,
        has_more: bool,
        now: i64,
        expires_at: i64,
    ) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO search_cache (query_hash, result_ids, total, has_more, created_at, expires_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
             ON CONFLICT(query_hash) DO UPDATE SET
               result_ids = excluded.result_ids,
               total = excluded.total,
               has_more = excluded.has_more,
               created_at = excluded.created_at,
               expires_at = excluded.expires_at,
               hit_count = 0",
            params![
                hash,
                serde_json::to_string(result_ids)?,
                total as i64,
                has_more,
                now,
                expires_at
            ],
        )?;
        Ok(())
    }

    /// Drop expired entries, then the oldest beyond `max_entries`.
    pub fn evict_search_entries(&self, max_entries: usize, now: i64) -> Result<usize, CacheError> {
        let expired = self.conn.execute(
            "DELETE FROM search_cache WHERE expires_at <= ?1",
            params![now],
        )?;
        let overflow = self.conn.execute(
            "DELETE FROM search_cache WHERE id IN (
               SELECT id FROM search_cache ORDER BY created_at DESC, id DESC
               LIMIT -1 OFFSET ?1
             )",
            params![max_entries as i64],
        )?;
        Ok(expired + overflow)
    }

    pub fn clear_search_cache(&self) -> Result<usize, CacheError> {
        Ok(self.conn.execute("DELETE FROM search_cache", [])?)
    }

    // ─── Registry sync ──────────────────────────────────────────────────

    pub fn get_sync(&self, registry: &str) -> Result<Option<RegistrySyncStatus>, CacheError> {
        Ok(self
            .conn
            .query_row(
                "SELECT registry, status, last_sync_at, last_success_at, server_count,
                        next_sync_at, error_message, sync_duration_ms, etag
                 FROM registry_sync WHERE registry = ?1",
                params![registry],
                row_to_sync,
            )
            .optional()?)
    }

    pub fn list_syncs(&self) -> Result<Vec<RegistrySyncStatus>, CacheError> {
        let mut stmt = self.conn.prepare(
            "SELECT registry, status, last_sync_at, last_success_at, server_count,
                    next_sync_at, error_message, sync_duration_ms, etag
             FROM registry_sync ORDER BY registry",
        )?;
        let rows = stmt
            .query_map([], row_to_sync)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert the sync row for `registry`.
    pub fn upsert_sync(
        &self,
        registry: &str,
        status: SyncState,
        update: &SyncRowUpdate,
    ) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO registry_sync (registry, status, last_sync_at, last_success_at, server_count,
                                        next_sync_at, error_message, sync_duration_ms, etag)
             VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0), ?6, ?7, ?8, ?9)
             ON CONFLICT(registry) DO UPDATE SET
               status = excluded.status,
               last_sync_at = COALESCE(?3, last_sync_at),
               last_success_at = COALESCE(?4, last_success_at),
               server_count = COALESCE(?5, server_count),
               next_sync_at = COALESCE(?6, next_sync_at),
               error_message = ?7,
               sync_duration_ms = COALESCE(?8, sync_duration_ms),
               etag = COALESCE(?9, etag)",
            params![
                registry,
                status.as_str(),
                update.last_sync_at,
                update.last_success_at,
                update.server_count.map(|c| c as i64),
                update.next_sync_at,
                update.error_message,
                update.duration_ms.map(|d| d as i64),
                update.etag,
            ],
        )?;
        Ok(())
    }

    // ─── Metrics & stats ────────────────────────────────────────────────

    pub fn record_metric(&self, metric: &PerformanceMetric, now: i64) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO performance_metrics
               (operation, duration_ms, cache_hit, result_count, error_count, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                metric.operation,
                metric.duration_ms as i64,
                metric.cache_hit,
                metric.result_count as i64,
                metric.error_count as i64,
                now
            ],
        )?;
        Ok(())
    }

    /// Number of recorded metrics for `operation`.
    pub fn count_metrics(&self, operation: &str) -> Result<usize, CacheError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM performance_metrics WHERE operation = ?1",
            params![operation],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        let mut stmt = self.conn.prepare(
            "SELECT registry, COUNT(*) FROM registry_servers
             WHERE is_active = 1 GROUP BY registry",
        )?;
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (registry, count) = row?;
            let count = count.max(0) as usize;
            stats.total_servers += count;
            stats.servers_by_registry.insert(registry, count);
        }

        let entries: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM search_cache", [], |row| row.get(0))?;
        stats.cache_entries = entries.max(0) as usize;

        let (searches, hits, average): (i64, Option<i64>, Option<f64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(cache_hit), AVG(duration_ms)
             FROM performance_metrics WHERE operation = ?1",
            params![SEARCH_OPERATION],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        stats.average_response_time_ms = average.unwrap_or(0.0);
        if searches > 0 {
            stats.cache_hit_rate = hits.unwrap_or(0) as f64 / searches as f64;
        }

        let (oldest, newest): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(last_fetched_at), MAX(last_fetched_at)
             FROM registry_servers WHERE is_active = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.oldest_entry = oldest.and_then(from_millis);
        stats.newest_entry = newest.and_then(from_millis);

        Ok(stats)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn upsert_record(
    conn: &Connection,
    record: &CachedServerRecord,
    now: i64,
) -> Result<bool, CacheError> {
    if let Some(package) = &record.package_name {
        let owner: Option<String> = conn
            .query_row(
                "SELECT id FROM registry_servers
                 WHERE package_name = ?1 AND is_active = 1",
                params![package],
                |row| row.get(0),
            )
            .optional()?;
        if owner.as_deref().is_some_and(|owner| owner != record.id) {
            tracing::debug!(
                id = %record.id,
                package = %package,
                owner = ?owner,
                "package name owned by another record, skipping"
            );
            return Ok(false);
        }
    }

    let mut stored = record.clone();
    stored.last_fetched_at = from_millis(now);
    stored.metrics_stale = false;
    let payload = serde_json::to_string(&stored)?;
    let tags = serde_json::to_string(&stored.tags)?;

    let result = conn.execute(
        "INSERT INTO registry_servers
           (id, name, description, author, package_name, registry, tags, rating, install_count,
            updated_at, is_active, last_fetched_at, search_vector, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           description = excluded.description,
           author = excluded.author,
           package_name = excluded.package_name,
           registry = excluded.registry,
           tags = excluded.tags,
           rating = excluded.rating,
           install_count = excluded.install_count,
           updated_at = excluded.updated_at,
           is_active = excluded.is_active,
           last_fetched_at = excluded.last_fetched_at,
           search_vector = excluded.search_vector,
           payload = excluded.payload",
        params![
            stored.id,
            stored.name,
            stored.description,
            stored.author,
            stored.package_name,
            stored.registry,
            tags,
            stored.rating,
            stored.install_count.map(|c| c as i64),
            stored.updated_at.timestamp_millis(),
            stored.is_active,
            now,
            stored.search_vector(),
            payload,
        ],
    );

    match result {
        Ok(_) => Ok(true),
        // Lost a race on the package-name index; first writer wins.
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            tracing::debug!(id = %record.id, "package name constraint hit, skipping");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn row_to_sync(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistrySyncStatus> {
    let status: String = row.get(1)?;
    Ok(RegistrySyncStatus {
        registry: row.get(0)?,
        status: SyncState::parse(&status),
        last_sync_at: row.get::<_, Option<i64>>(2)?.and_then(from_millis),
        last_success_at: row.get::<_, Option<i64>>(3)?.and_then(from_millis),
        server_count: row.get::<_, i64>(4)?.max(0) as usize,
        next_sync_at: row.get::<_, Option<i64>>(5)?.and_then(from_millis),
        error_message: row.get(6)?,
        sync_duration_ms: row.get::<_, Option<i64>>(7)?.map(|d| d.max(0) as u64),
        etag: row.get(8)?,
    })
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn like_pattern(value: &str) -> String {
    format!("%{}%", escape_like(value))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
