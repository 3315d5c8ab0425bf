//! Batch connection helpers over [`ConcurrencyManager`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::errors::{ConcurrencyError, TaskError};
use super::executor::{ConcurrencyManager, ExecuteOptions, TaskOptions, TaskResult};
use crate::mcp_client::{ConnectResult, ConnectionPoolManager, ServerConnectionManager};
use crate::servers::{ServerConfig, ToolDefinition};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelConnectOptions {
    /// Temporary limit for this batch; the previous limit is restored after.
    pub max_concurrency: Option<usize>,
    pub fail_fast: bool,
    /// Connect through the pool so the connections stay warm for reuse.
    pub use_connection_pool: bool,
}

/// Per-server outcome of a batch connect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConnectResult {
    pub server_id: String,
    pub success: bool,
    pub tools: Vec<ToolDefinition>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<TaskResult<ConnectResult>> for BatchConnectResult {
    fn from(result: TaskResult<ConnectResult>) -> Self {
        let error = result.error.map(|e| match e {
            TaskError::Failed { reason } => reason,
            other => other.to_string(),
        });
        Self {
            server_id: result.id,
            success: result.success,
            tools: result.value.map(|r| r.tools).unwrap_or_default(),
            error,
            duration_ms: result.duration_ms,
        }
    }
}

/// Restores the executor's limit when dropped, including on early return.
struct LimitRestore<'a> {
    manager: &'a ConcurrencyManager,
    previous: usize,
}

impl Drop for LimitRestore<'_> {
    fn drop(&mut self) {
        self.manager.update_concurrency(self.previous);
    }
}

pub struct BatchConnector {
    concurrency: Arc<ConcurrencyManager>,
    connections: ServerConnectionManager,
    pool: Arc<ConnectionPoolManager>,
}

impl BatchConnector {
    pub fn new(
        concurrency: Arc<ConcurrencyManager>,
        connections: ServerConnectionManager,
        pool: Arc<ConnectionPoolManager>,
    ) -> Self {
        Self {
            concurrency,
            connections,
            pool,
        }
    }

    /// Connect `ids` in parallel. Earlier ids get higher priority.
    pub async fn connect_servers_parallel(
        &self,
        ids: &[String],
        options: ParallelConnectOptions,
    ) -> Result<Vec<BatchConnectResult>, ConcurrencyError> {
        let _restore = options.max_concurrency.map(|limit| {
            let previous = self.concurrency.get_status().max_concurrency;
            self.concurrency.update_concurrency(limit);
            LimitRestore {
                manager: &self.concurrency,
                previous,
            }
        });

        let count = ids.len();
        let tasks = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let connections = self.connections.clone();
                let pool = self.pool.clone();
                let server = id.clone();
                let use_pool = options.use_connection_pool;
                ConcurrencyManager::create_task(
                    id.clone(),
                    move || {
                        let connections = connections.clone();
                        let pool = pool.clone();
                        let server = server.clone();
                        async move {
                            let pooled = if use_pool {
                                connections.store().get(&server)
                            } else {
                                None
                            };
                            let result = match pooled {
                                Some(config) => pool.initialize_pool(&config).await,
                                None => connections.connect(&server).await,
                            };
                            if result.success {
                                Ok(result)
                            } else {
                                Err(result
                                    .error
                                    .unwrap_or_else(|| "connect failed".to_string()))
                            }
                        }
                    },
                    TaskOptions {
                        priority: (count - index) as i32,
                        ..TaskOptions::default()
                    },
                )
            })
            .collect();

        let results = self
            .concurrency
            .execute_parallel(
                tasks,
                ExecuteOptions {
                    fail_fast: options.fail_fast,
                    max_retries: None,
                },
            )
            .await?;

        let results: Vec<BatchConnectResult> = results.into_iter().map(Into::into).collect();
        let connected = results.iter().filter(|r| r.success).count();
        tracing::info!(requested = count, connected, "parallel connect finished");
        Ok(results)
    }

    /// Connect `configs` in sequential batches of `batch_size`, pausing
    /// `delay` between batches.
    pub async fn connect_servers_batch(
        &self,
        configs: &[ServerConfig],
        batch_size: usize,
        delay: Duration,
    ) -> Result<Vec<BatchConnectResult>, ConcurrencyError> {
        let batches: Vec<&[ServerConfig]> = configs.chunks(batch_size.max(1)).collect();
        let mut results = Vec::with_capacity(configs.len());

        for (index, batch) in batches.iter().enumerate() {
            let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
            tracing::debug!(batch = index + 1, of = batches.len(), size = ids.len(), "connecting batch");
            results.extend(
                self.connect_servers_parallel(&ids, ParallelConnectOptions::default())
                    .await?,
            );
            if index + 1 < batches.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(results)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{
        fast_timeouts, filesystem_server, manager_with, wait_for_status, FakeSpawner,
        ScriptedServer,
    };
    use crate::servers::ServerStatus;

    struct Fixture {
        _dir: tempfile::TempDir,
        spawner: Arc<FakeSpawner>,
        connector: BatchConnector,
        configs: Vec<ServerConfig>,
    }

    fn fixture(count: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let configs: Vec<ServerConfig> = (0..count)
            .map(|i| filesystem_server(&format!("fs{i}"), dir.path()))
            .collect();
        let spawner = Arc::new(FakeSpawner::new(ScriptedServer::default()));
        let connections = manager_with(configs.clone(), spawner.clone(), fast_timeouts());
        let pool = Arc::new(ConnectionPoolManager::new(connections.clone()));
        let concurrency = Arc::new(ConcurrencyManager::new(5, Duration::from_millis(1)));
        Fixture {
            _dir: dir,
            spawner,
            connector: BatchConnector::new(concurrency, connections, pool),
            configs,
        }
    }

    fn ids(configs: &[ServerConfig]) -> Vec<String> {
        configs.iter().map(|c| c.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_parallel_connect_reports_each_server() {
        let f = fixture(3);
        let mut requested = ids(&f.configs);
        requested.push("missing".into());

        let results = f
            .connector
            .connect_servers_parallel(&requested, ParallelConnectOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.success));
        assert!(!results[3].success);
        assert!(results[3].error.as_deref().unwrap().contains("unknown server"));
        assert_eq!(f.spawner.spawn_count(), 3);
    }

    #[tokio::test]
    async fn test_temporary_limit_is_restored() {
        let f = fixture(2);
        f.connector
            .connect_servers_parallel(
                &ids(&f.configs),
                ParallelConnectOptions {
                    max_concurrency: Some(1),
                    ..ParallelConnectOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(f.connector.concurrency.get_status().max_concurrency, 5);
    }

    #[tokio::test]
    async fn test_pooled_connect_initializes_pools() {
        let f = fixture(2);
        let results = f
            .connector
            .connect_servers_parallel(
                &ids(&f.configs),
                ParallelConnectOptions {
                    use_connection_pool: true,
                    ..ParallelConnectOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.success));
        assert!(f.connector.pool.has_pool("fs0"));
        assert!(f.connector.pool.has_pool("fs1"));
        assert!(wait_for_status(&f.connector.connections, "fs1", ServerStatus::Ready).await);
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let f = fixture(5);
        let results = f
            .connector
            .connect_servers_batch(&f.configs, 2, Duration::from_millis(5))
            .await
            .unwrap();
        let connected: Vec<String> = results.iter().map(|r| r.server_id.clone()).collect();
        assert_eq!(connected, ids(&f.configs));
        assert_eq!(f.spawner.spawn_count(), 5);
    }
}
