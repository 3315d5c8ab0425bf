//! Concurrency error types.

use thiserror::Error;

/// Terminal outcome of a task that did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The work returned an error on its last attempt.
    #[error("task failed: {reason}")]
    Failed { reason: String },

    /// The last attempt exceeded the task's timeout.
    #[error("task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The task was never finished because another task failed fast.
    #[error("task cancelled")]
    Cancelled,
}

/// Errors from the executor itself.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("concurrency manager is shut down")]
    ShutDown,
}
