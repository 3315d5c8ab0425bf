//! Bounded-parallelism execution and the batch-connect helpers built on it.

pub mod batch;
pub mod errors;
pub mod executor;

pub use batch::{BatchConnectResult, BatchConnector, ParallelConnectOptions};
pub use errors::{ConcurrencyError, TaskError};
pub use executor::{
    ConcurrencyManager, ConcurrencyStats, ConcurrencyStatus, ExecuteOptions, Task, TaskOptions,
    TaskResult,
};
