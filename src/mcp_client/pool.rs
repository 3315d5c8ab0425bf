//! Warm, reusable connections keyed by server id.
//!
//! The pool sits on top of [`ServerConnectionManager`]: it decides whether a
//! caller can reuse an already-handshaken process or has to connect directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;

use super::connection::{ConnectResult, ServerConnectionManager};
use crate::servers::{ServerConfig, ServerStatus, ToolDefinition};

/// A handle to a pooled connection.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub server_id: String,
    pub status: ServerStatus,
    pub tools: Vec<ToolDefinition>,
    pub acquired_at: Instant,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub pools: usize,
    pub hits: u64,
    pub misses: u64,
    pub warm_connections: usize,
    pub in_use: usize,
    /// `hits / (hits + misses)`, 0 with no acquisitions.
    pub hit_rate: f64,
}

struct PoolEntry {
    created_at: Instant,
    last_used: Instant,
    uses: u64,
    in_use: usize,
}

pub struct ConnectionPoolManager {
    connections: ServerConnectionManager,
    pools: Mutex<HashMap<String, PoolEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConnectionPoolManager {
    pub fn new(connections: ServerConnectionManager) -> Self {
        Self {
            connections,
            pools: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create the pool for `config` and start its connection.
    ///
    /// Idempotent per id: a second call returns the existing pool's tools.
    pub async fn initialize_pool(&self, config: &ServerConfig) -> ConnectResult {
        if self.lock_pools().contains_key(&config.id) {
            tracing::debug!(server = %config.id, "pool already initialized");
            return ConnectResult::ok(self.connections.tools(&config.id));
        }

        let result = self.connections.connect(&config.id).await;
        if result.success {
            let now = Instant::now();
            self.lock_pools()
                .entry(config.id.clone())
                .or_insert(PoolEntry {
                    created_at: now,
                    last_used: now,
                    uses: 0,
                    in_use: 0,
                });
            tracing::info!(server = %config.id, "connection pool initialized");
        }
        result
    }

    /// Take a pooled handle for `id`.
    ///
    /// `None` means there is no usable pool and the caller should connect
    /// directly through the connection manager.
    pub fn acquire_connection(&self, id: &str) -> Option<PooledConnection> {
        let status = self.connections.state(id);
        let mut pools = self.lock_pools();

        let Some(entry) = pools.get_mut(id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if !status.is_live() {
            // The underlying process died; the pool is stale.
            pools.remove(id);
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(server = %id, %status, "evicted stale pool");
            return None;
        }

        entry.uses += 1;
        entry.in_use += 1;
        entry.last_used = Instant::now();
        drop(pools);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(PooledConnection {
            server_id: id.to_string(),
            status,
            tools: self.connections.tools(id),
            acquired_at: Instant::now(),
        })
    }

    /// Return a handle taken with [`acquire_connection`](Self::acquire_connection).
    pub fn release(&self, connection: PooledConnection) {
        if let Some(entry) = self.lock_pools().get_mut(&connection.server_id) {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    pub fn has_pool(&self, id: &str) -> bool {
        self.lock_pools().contains_key(id)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let pools = self.lock_pools();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        PoolMetrics {
            pools: pools.len(),
            hits,
            misses,
            warm_connections: pools
                .keys()
                .filter(|id| self.connections.state(id) == ServerStatus::Ready)
                .count(),
            in_use: pools.values().map(|e| e.in_use).sum(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Tear down every pooled connection.
    ///
    /// Call on process shutdown; otherwise pooled servers outlive the hub.
    pub async fn cleanup(&self) -> usize {
        let drained: Vec<(String, PoolEntry)> = self.lock_pools().drain().collect();
        for (id, entry) in &drained {
            tracing::debug!(
                server = %id,
                uses = entry.uses,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                idle_ms = entry.last_used.elapsed().as_millis() as u64,
                "closing pooled connection"
            );
            self.connections.disconnect(id).await;
        }
        tracing::info!(count = drained.len(), "connection pools cleaned up");
        drained.len()
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
