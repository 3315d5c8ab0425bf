//! Bounded-parallelism task executor with priority, timeout and retry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;

use super::errors::{ConcurrencyError, TaskError};
use crate::settings::ConcurrencySettings;

/// Re-runnable unit of work. Called once per attempt.
pub type TaskWork<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// Per-task scheduling options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher priorities start first. Ties keep submission order.
    pub priority: i32,
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first failure.
    pub retry_attempts: u32,
}

/// A task descriptor built by [`ConcurrencyManager::create_task`].
pub struct Task<T> {
    pub id: String,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub retry_attempts: u32,
    work: TaskWork<T>,
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Stop scheduling and cancel in-flight tasks on the first failure.
    pub fail_fast: bool,
    /// Overrides every task's own `retry_attempts` when set.
    pub max_retries: Option<u32>,
}

/// Outcome of one task. `error` holds the terminal error after retries.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub id: String,
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<TaskError>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl<T> TaskResult<T> {
    fn cancelled(id: String) -> Self {
        Self {
            id,
            success: false,
            value: None,
            error: Some(TaskError::Cancelled),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStatus {
    pub max_concurrency: usize,
    pub active_tasks: usize,
    pub is_shut_down: bool,
}

/// Cumulative counters since construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
}

pub struct ConcurrencyManager {
    max_concurrency: AtomicUsize,
    retry_base_delay: Duration,
    active: AtomicUsize,
    idle: Notify,
    shut_down: AtomicBool,
    counters: Counters,
}

/// Counts a task as in flight for as long as it lives.
struct ActiveGuard<'a>(&'a ConcurrencyManager);

impl<'a> ActiveGuard<'a> {
    fn new(manager: &'a ConcurrencyManager) -> Self {
        manager.active.fetch_add(1, Ordering::SeqCst);
        Self(manager)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl ConcurrencyManager {
    pub fn new(max_concurrency: usize, retry_base_delay: Duration) -> Self {
        Self {
            max_concurrency: AtomicUsize::new(max_concurrency.max(1)),
            retry_base_delay,
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            shut_down: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn from_settings(settings: &ConcurrencySettings) -> Self {
        Self::new(
            settings.max_concurrency,
            Duration::from_millis(settings.retry_base_delay_ms),
        )
    }

    /// Build a task descriptor around a re-runnable future factory.
    pub fn create_task<T, F, Fut>(id: impl Into<String>, work: F, options: TaskOptions) -> Task<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        Task {
            id: id.into(),
            priority: options.priority,
            timeout: options.timeout_ms.map(Duration::from_millis),
            retry_attempts: options.retry_attempts,
            work: Arc::new(move || -> BoxFuture<'static, Result<T, String>> { Box::pin(work()) }),
        }
    }

    /// Run `tasks` with at most `max_concurrency` in flight.
    ///
    /// Returns one result per task, in submission order. The limit is
    /// re-read before every launch, so [`update_concurrency`](Self::update_concurrency)
    /// affects tasks not yet started.
    pub async fn execute_parallel<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        options: ExecuteOptions,
    ) -> Result<Vec<TaskResult<T>>, ConcurrencyError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ConcurrencyError::ShutDown);
        }

        let total = tasks.len();
        self.counters
            .submitted
            .fetch_add(total as u64, Ordering::Relaxed);
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        let mut queue: Vec<(usize, Task<T>)> = tasks.into_iter().enumerate().collect();
        queue.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        let mut queue = queue.into_iter();

        let mut results: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < self.max_concurrency.load(Ordering::SeqCst) {
                let Some((index, task)) = queue.next() else {
                    break;
                };
                let retries = options.max_retries.unwrap_or(task.retry_attempts);
                let guard = ActiveGuard::new(self);
                running.push(async move {
                    let _guard = guard;
                    (index, self.run_task(task, retries).await)
                });
            }

            let Some((index, result)) = running.next().await else {
                break;
            };
            let failed = !result.success;
            results[index] = Some(result);
            if failed && options.fail_fast {
                tracing::debug!(task = %ids[index], "task failed, cancelling remaining tasks");
                break;
            }
        }
        // In-flight tasks are cancelled here when fail-fast stopped the loop.
        drop(running);

        Ok(results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| {
                result.unwrap_or_else(|| {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    TaskResult::cancelled(id)
                })
            })
            .collect())
    }

    async fn run_task<T>(&self, task: Task<T>, retries: u32) -> TaskResult<T> {
        let started = Instant::now();
        let mut attempts = 0;

        let error = loop {
            attempts += 1;
            let outcome = match task.timeout {
                Some(limit) => match tokio::time::timeout(limit, (task.work)()).await {
                    Ok(outcome) => outcome.map_err(|reason| TaskError::Failed { reason }),
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        Err(TaskError::Timeout {
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }
                },
                None => (task.work)()
                    .await
                    .map_err(|reason| TaskError::Failed { reason }),
            };

            match outcome {
                Ok(value) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    return TaskResult {
                        id: task.id,
                        success: true,
                        value: Some(value),
                        error: None,
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) if attempts <= retries => {
                    let delay = self.retry_base_delay * 2u32.pow((attempts - 1).min(10));
                    tracing::debug!(
                        task = %task.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying task"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break e,
            }
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(task = %task.id, attempts, error = %error, "task failed");
        TaskResult {
            id: task.id,
            success: false,
            value: None,
            error: Some(error),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Change the limit for tasks scheduled from now on.
    pub fn update_concurrency(&self, max_concurrency: usize) {
        let max_concurrency = max_concurrency.max(1);
        let previous = self.max_concurrency.swap(max_concurrency, Ordering::SeqCst);
        if previous != max_concurrency {
            tracing::info!(previous, max_concurrency, "concurrency limit updated");
        }
    }

    pub fn get_status(&self) -> ConcurrencyStatus {
        ConcurrencyStatus {
            max_concurrency: self.max_concurrency.load(Ordering::SeqCst),
            active_tasks: self.active.load(Ordering::SeqCst),
            is_shut_down: self.shut_down.load(Ordering::SeqCst),
        }
    }

    pub fn get_stats(&self) -> ConcurrencyStats {
        let c = &self.counters;
        ConcurrencyStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Refuse new work and wait for in-flight tasks to finish.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        tracing::info!("concurrency manager shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn manager(limit: usize) -> ConcurrencyManager {
        ConcurrencyManager::new(limit, Duration::from_millis(1))
    }

    fn sleeper(id: &str, ms: u64, priority: i32) -> Task<String> {
        let value = id.to_string();
        ConcurrencyManager::create_task(
            id,
            move || {
                let value = value.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(value)
                }
            },
            TaskOptions {
                priority,
                ..TaskOptions::default()
            },
        )
    }

    fn failing(id: &str) -> Task<String> {
        ConcurrencyManager::create_task(
            id,
            || async { Err::<String, _>("boom".to_string()) },
            TaskOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_results_in_submission_order_within_limit() {
        let manager = manager(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<usize>> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                ConcurrencyManager::create_task(
                    format!("t{i}"),
                    move || {
                        let running = running.clone();
                        let peak = peak.clone();
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                    },
                    TaskOptions::default(),
                )
            })
            .collect();

        let results = manager
            .execute_parallel(tasks, ExecuteOptions::default())
            .await
            .unwrap();
        let values: Vec<usize> = results.iter().map(|r| r.value.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.get_stats().succeeded, 6);
        assert_eq!(manager.get_status().active_tasks, 0);
    }

    #[tokio::test]
    async fn test_higher_priority_starts_first() {
        let manager = manager(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<Task<()>> = [("low", 1), ("high", 10), ("mid", 5)]
            .into_iter()
            .map(|(id, priority)| {
                let order = order.clone();
                ConcurrencyManager::create_task(
                    id,
                    move || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(id);
                            Ok(())
                        }
                    },
                    TaskOptions {
                        priority,
                        ..TaskOptions::default()
                    },
                )
            })
            .collect();

        manager
            .execute_parallel(tasks, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let manager = manager(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = ConcurrencyManager::create_task(
            "flaky",
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
            TaskOptions {
                retry_attempts: 2,
                ..TaskOptions::default()
            },
        );

        let results = manager
            .execute_parallel(vec![task], ExecuteOptions::default())
            .await
            .unwrap();
        assert!(results[0].success);
        assert_eq!(results[0].attempts, 3);
        assert_eq!(manager.get_stats().retries, 2);
    }

    #[tokio::test]
    async fn test_max_retries_overrides_task_retries() {
        let manager = manager(1);
        let results = manager
            .execute_parallel(
                vec![failing("f")],
                ExecuteOptions {
                    fail_fast: false,
                    max_retries: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(results[0].attempts, 2);
        assert_eq!(
            results[0].error,
            Some(TaskError::Failed {
                reason: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_error() {
        let manager = manager(1);
        let task = ConcurrencyManager::create_task(
            "slow",
            || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            TaskOptions {
                timeout_ms: Some(20),
                ..TaskOptions::default()
            },
        );
        let results = manager
            .execute_parallel(vec![task], ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].error, Some(TaskError::Timeout { timeout_ms: 20 }));
        assert_eq!(manager.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_outstanding() {
        let manager = manager(1);
        let tasks = vec![failing("a"), sleeper("b", 1, 0), sleeper("c", 1, 0)];
        let results = manager
            .execute_parallel(
                tasks,
                ExecuteOptions {
                    fail_fast: true,
                    max_retries: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0].error, Some(TaskError::Failed { .. })));
        assert_eq!(results[1].error, Some(TaskError::Cancelled));
        assert_eq!(results[2].error, Some(TaskError::Cancelled));
        assert_eq!(results[2].id, "c");
        assert_eq!(manager.get_stats().cancelled, 2);
    }

    #[tokio::test]
    async fn test_without_fail_fast_every_task_runs() {
        let manager = manager(1);
        let results = manager
            .execute_parallel(
                vec![failing("a"), sleeper("b", 1, 0)],
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(results[1].value.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_update_concurrency_clamps_to_one() {
        let manager = manager(5);
        manager.update_concurrency(0);
        assert_eq!(manager.get_status().max_concurrency, 1);
        manager.update_concurrency(8);
        assert_eq!(manager.get_status().max_concurrency, 8);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses_new_work() {
        let manager = Arc::new(manager(2));
        let worker = manager.clone();
        let handle = tokio::spawn(async move {
            worker
                .execute_parallel(vec![sleeper("long", 100, 0)], ExecuteOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.get_status().active_tasks, 1);

        manager.shutdown().await;
        assert_eq!(manager.get_status().active_tasks, 0);
        assert!(manager.get_status().is_shut_down);

        let results = handle.await.unwrap().unwrap();
        assert!(results[0].success);

        let refused = manager
            .execute_parallel(vec![sleeper("late", 1, 0)], ExecuteOptions::default())
            .await;
        assert!(matches!(refused, Err(ConcurrencyError::ShutDown)));
    }
}
