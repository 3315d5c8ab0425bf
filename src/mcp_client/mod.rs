//! MCP client: tool-server processes spoken to with JSON-RPC over stdio.
//!
//! This module handles:
//! - Building launch commands from server configs
//! - Spawning server child processes and draining their output
//! - The `initialize` / `tools/list` handshake
//! - Per-server connection state, health and graceful shutdown
//! - Pooling warm connections for reuse

pub mod connection;
pub mod errors;
pub mod framing;
pub mod handshake;
pub mod launch;
pub mod pool;
pub mod process;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

// Re-exports for convenience
pub use connection::{ConnectResult, ServerConnectionManager, StatusChange};
pub use errors::McpError;
pub use launch::build_launch_spec;
pub use pool::{ConnectionPoolManager, PoolMetrics, PooledConnection};
pub use process::{LaunchSpec, ProcessSpawner, TokioProcessSpawner};
