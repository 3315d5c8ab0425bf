//! Server connection manager.
//!
//! Owns the per-server state machine:
//!
//! ```text
//! disconnected -> connecting -> handshaking -> ready
//!        ^             |              |          |
//!        +---- error <-+--------------+----------+
//! ```
//!
//! `connect` resolves as soon as the process has spawned. The handshake runs
//! in a per-process session task which reports back over a channel; a single
//! control loop applies those reports to the live map and the config store.
//! Every session carries a generation number, so a report from a process that
//! has already been replaced or disconnected is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::handshake;
use super::launch::build_launch_spec;
use super::process::{drain_stderr, terminate, ProcessSpawner, SpawnedProcess, StderrTail};
use super::transport::StdioTransport;
use crate::servers::{ConfigStore, ConfigValidator, ServerConfig, ServerStatus, ToolDefinition};
use crate::settings::ConnectionTimeouts;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Outcome of a connect or test call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectResult {
    pub success: bool,
    pub tools: Vec<ToolDefinition>,
    pub error: Option<String>,
}

impl ConnectResult {
    pub fn ok(tools: Vec<ToolDefinition>) -> Self {
        Self {
            success: true,
            tools,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tools: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub server: String,
    pub status: ServerStatus,
    pub error: Option<String>,
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// Reports from session tasks to the control loop.
#[derive(Debug)]
enum ConnectionEvent {
    Ready {
        server: String,
        generation: u64,
        protocol_version: String,
        tools: Vec<ToolDefinition>,
        latency_ms: f64,
    },
    Failed {
        server: String,
        generation: u64,
        error: String,
    },
}

struct LiveConnection {
    generation: u64,
    status: ServerStatus,
    /// Dropping or firing this stops the session.
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<ConfigStore>,
    validator: Arc<ConfigValidator>,
    spawner: Arc<dyn ProcessSpawner>,
    timeouts: ConnectionTimeouts,
    live: Mutex<HashMap<String, LiveConnection>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    changes: broadcast::Sender<StatusChange>,
    next_generation: AtomicU64,
}

// ─── ServerConnectionManager ─────────────────────────────────────────────────

/// Spawns tool servers and drives them to `ready`.
///
/// Cheap to clone; clones share state. Must be created inside a Tokio
/// runtime because construction starts the control loop.
#[derive(Clone)]
pub struct ServerConnectionManager {
    inner: Arc<Inner>,
}

impl ServerConnectionManager {
    pub fn new(
        store: Arc<ConfigStore>,
        validator: Arc<ConfigValidator>,
        spawner: Arc<dyn ProcessSpawner>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            store,
            validator,
            spawner,
            timeouts,
            live: Mutex::new(HashMap::new()),
            events,
            changes,
            next_generation: AtomicU64::new(1),
        });
        tokio::spawn(control_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    pub fn validator(&self) -> &Arc<ConfigValidator> {
        &self.inner.validator
    }

    /// Receive every subsequent state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.changes.subscribe()
    }

    /// Connect to server `id`.
    ///
    /// Returns once the process has spawned, with an empty tool list; the
    /// handshake continues in the background. If the server is already
    /// connecting or connected this returns success without spawning.
    pub async fn connect(&self, id: &str) -> ConnectResult {
        let started = Instant::now();
        let Some(generation) = self.inner.reserve(id) else {
            tracing::debug!(server = %id, "connect ignored, already connecting or connected");
            let tools = self.inner.store.get(id).map(|c| c.tools).unwrap_or_default();
            return ConnectResult::ok(tools);
        };

        match self.inner.start(id, generation, started) {
            Ok(()) => ConnectResult::ok(Vec::new()),
            Err(e) => {
                self.inner.abort(id, generation, &e);
                ConnectResult::failure(e.to_string())
            }
        }
    }

    /// Stop server `id`. Returns whether a live connection was torn down.
    ///
    /// Closes stdin, gives the process the shutdown grace period, then kills
    /// it. A server in `error` is moved back to `disconnected`.
    pub async fn disconnect(&self, id: &str) -> bool {
        let removed = self.inner.lock_live().remove(id);

        let Some(mut conn) = removed else {
            if self.inner.store.get(id).map(|c| c.status) == Some(ServerStatus::Error) {
                self.inner.set_status(id, ServerStatus::Disconnected, |_| {});
            }
            return false;
        };

        if let Some(shutdown) = conn.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = conn.task.take() {
            let wait = self.inner.timeouts.shutdown_grace() * 2 + Duration::from_millis(500);
            if tokio::time::timeout(wait, task).await.is_err() {
                tracing::warn!(server = %id, "session did not stop within shutdown window");
            }
        }

        self.inner
            .set_status(id, ServerStatus::Disconnected, |c| {
                c.connection_health.uptime_marker = None;
            });
        tracing::info!(server = %id, "server disconnected");
        true
    }

    /// Disconnect every live server. Individual failures are tolerated.
    pub async fn disconnect_all(&self) -> usize {
        let ids: Vec<String> = self.inner.lock_live().keys().cloned().collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
        results.into_iter().filter(|stopped| *stopped).count()
    }

    /// Disconnect and connect again, re-running tool discovery.
    pub async fn refresh_tools(&self, id: &str) -> ConnectResult {
        self.disconnect(id).await;
        self.connect(id).await
    }

    /// Current state of server `id`.
    pub fn state(&self, id: &str) -> ServerStatus {
        if let Some(conn) = self.inner.lock_live().get(id) {
            return conn.status;
        }
        self.inner
            .store
            .get(id)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Tools of a `ready` server (empty otherwise).
    pub fn tools(&self, id: &str) -> Vec<ToolDefinition> {
        if self.state(id) != ServerStatus::Ready {
            return Vec::new();
        }
        self.inner.store.get(id).map(|c| c.tools).unwrap_or_default()
    }

    /// Number of servers with a live or reserved connection.
    pub fn live_count(&self) -> usize {
        self.inner.lock_live().len()
    }

    /// One-shot connectivity check.
    ///
    /// Validates, spawns, handshakes without the pre-fetch delay, then kills
    /// the process. Neither the live map nor the store is touched.
    pub async fn test_connection(&self, config: &ServerConfig) -> ConnectResult {
        let inner = &self.inner;
        let validation = inner.validator.validate(config);
        if !validation.valid {
            return ConnectResult::failure(
                McpError::InvalidConfig {
                    server: config.id.clone(),
                    reason: validation.error_summary(),
                }
                .to_string(),
            );
        }

        let spec = build_launch_spec(config, inner.validator.launcher());
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            mut child,
        } = match inner.spawner.spawn(&config.id, &spec) {
            Ok(process) => process,
            Err(e) => return ConnectResult::failure(e.to_string()),
        };

        let tail = StderrTail::default();
        if let Some(stderr) = stderr {
            drain_stderr(&config.id, stderr, tail.clone());
        }
        let transport = StdioTransport::new(&config.id, stdin, stdout);
        let ceiling = inner.timeouts.test_timeout();
        let fetch_ceiling = inner.timeouts.tool_fetch_timeout();

        let exchange = async {
            handshake::initialize(&transport, &config.id).await?;
            handshake::fetch_tools(&transport, &config.id, fetch_ceiling).await
        };
        let outcome = tokio::select! {
            result = tokio::time::timeout(ceiling, exchange) => match result {
                Ok(Ok(tools)) => Ok(tools),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(McpError::Timeout {
                    server: config.id.clone(),
                    phase: "connection test".into(),
                    timeout_ms: inner.timeouts.test_timeout_ms,
                }
                .to_string()),
            },
            status = child.wait() => Err(exit_reason(&config.id, status)),
        };

        transport.close_stdin().await;
        let _ = child.start_kill();
        let _ = tokio::time::timeout(inner.timeouts.shutdown_grace(), child.wait()).await;

        match outcome {
            Ok(tools) => {
                tracing::info!(server = %config.id, tools = tools.len(), "connection test passed");
                ConnectResult::ok(tools)
            }
            Err(reason) => {
                let reason = format!("{reason}{}", tail.suffix());
                tracing::warn!(server = %config.id, error = %reason, "connection test failed");
                ConnectResult::failure(reason)
            }
        }
    }
}

// ─── Inner: caller-path transitions ──────────────────────────────────────────

impl Inner {
    fn lock_live(&self) -> MutexGuard<'_, HashMap<String, LiveConnection>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `id` for a new connection. `None` if one is already live.
    fn reserve(&self, id: &str) -> Option<u64> {
        let mut live = self.lock_live();
        if live.get(id).is_some_and(|c| c.status.is_live()) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        live.insert(
            id.to_string(),
            LiveConnection {
                generation,
                status: ServerStatus::Connecting,
                shutdown: None,
                task: None,
            },
        );
        Some(generation)
    }

    fn start(&self, id: &str, generation: u64, started: Instant) -> Result<(), McpError> {
        let config = self.store.get(id).ok_or_else(|| McpError::UnknownServer {
            server: id.to_string(),
        })?;

        let claimed = self.if_current(id, generation, |_| {
            self.set_status(id, ServerStatus::Connecting, |c| {
                c.connection_health.record_attempt(Utc::now());
                c.error_message = None;
            });
        });
        if claimed.is_none() {
            return Err(McpError::Disconnected {
                server: id.to_string(),
            });
        }

        let validation = self.validator.validate(&config);
        for warning in &validation.warnings {
            tracing::debug!(server = %id, field = %warning.field, "validation warning: {}", warning.message);
        }
        if !validation.valid {
            return Err(McpError::InvalidConfig {
                server: id.to_string(),
                reason: validation.error_summary(),
            });
        }

        let spec = build_launch_spec(&config, self.validator.launcher());
        tracing::info!(server = %id, command = %spec.display(), "spawning server");
        let process = self.spawner.spawn(id, &spec)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session = Session {
            server: id.to_string(),
            generation,
            started,
            timeouts: self.timeouts.clone(),
            events: self.events.clone(),
        };

        let still_ours = self
            .if_current(id, generation, |conn| {
                conn.status = ServerStatus::Handshaking;
                conn.shutdown = Some(shutdown_tx);
                self.set_status(id, ServerStatus::Handshaking, |_| {});
            })
            .is_some();
        if !still_ours {
            // Disconnected while spawning. The shutdown sender was dropped
            // with the closure, so the session closes the process straight away.
            tokio::spawn(session.run(process, shutdown_rx));
            return Err(McpError::Disconnected {
                server: id.to_string(),
            });
        }
        tracing::debug!(server = %id, generation, "handshaking");

        let task = tokio::spawn(session.run(process, shutdown_rx));
        self.if_current(id, generation, |conn| conn.task = Some(task));
        Ok(())
    }

    /// Run `f` on the live entry of `id` while `generation` still owns it.
    ///
    /// The live map stays locked for the duration of `f`, so a store write
    /// made inside it cannot land after a concurrent `disconnect`.
    fn if_current<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut LiveConnection) -> R,
    ) -> Option<R> {
        let mut live = self.lock_live();
        live.get_mut(id)
            .filter(|conn| conn.generation == generation)
            .map(f)
    }

    /// Undo a reservation after a failed start.
    fn abort(&self, id: &str, generation: u64, error: &McpError) {
        if let McpError::UnknownServer { .. } = error {
            self.release(id, generation);
            tracing::warn!(server = %id, "connect requested for unknown server");
            return;
        }
        let owned = self
            .if_current(id, generation, |_| self.mark_failed(id, &error.to_string()))
            .is_some();
        if owned {
            self.release(id, generation);
        } else {
            tracing::debug!(server = %id, error = %error, "connect superseded");
        }
    }

    /// Drop the live entry of `id` if `generation` still owns it.
    fn release(&self, id: &str, generation: u64) -> Option<LiveConnection> {
        let mut live = self.lock_live();
        match live.get(id) {
            Some(conn) if conn.generation == generation => live.remove(id),
            _ => None,
        }
    }

    // ─── Control-loop transitions ───────────────────────────────────────

    fn apply(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ready {
                server,
                generation,
                protocol_version,
                tools,
                latency_ms,
            } => {
                let count = tools.len();
                let applied = self.if_current(&server, generation, |conn| {
                    conn.status = ServerStatus::Ready;
                    self.set_status(&server, ServerStatus::Ready, |c| {
                        let now = Utc::now();
                        c.tools = tools;
                        c.protocol_version = Some(protocol_version);
                        c.last_connected_at = Some(now);
                        c.error_message = None;
                        c.connection_health.record_success(latency_ms, now);
                    });
                });
                if applied.is_none() {
                    tracing::debug!(server = %server, generation, "dropping stale ready report");
                    return;
                }
                tracing::info!(server = %server, tools = count, latency_ms, "server ready");
            }
            ConnectionEvent::Failed {
                server,
                generation,
                error,
            } => {
                let failed = self
                    .if_current(&server, generation, |_| self.mark_failed(&server, &error))
                    .is_some();
                if !failed {
                    tracing::debug!(server = %server, generation, error = %error, "dropping stale failure report");
                    return;
                }
                self.release(&server, generation);
            }
        }
    }

    fn mark_failed(&self, id: &str, error: &str) {
        tracing::warn!(server = %id, error = %error, "server connection failed");
        let message = error.to_string();
        self.set_status(id, ServerStatus::Error, |c| {
            c.connection_health.record_failure(&message, Utc::now());
            c.error_message = Some(message.clone());
        });
    }

    /// Apply `f`, set `status`, persist and publish.
    fn set_status<F>(&self, id: &str, status: ServerStatus, f: F)
    where
        F: FnOnce(&mut ServerConfig),
    {
        let result = self.store.update(id, |c| {
            f(c);
            c.set_status(status);
        });
        let error = match result {
            Ok(config) => config.error_message,
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "failed to persist server state");
                None
            }
        };
        tracing::debug!(server = %id, %status, "state transition");
        let _ = self.changes.send(StatusChange {
            server: id.to_string(),
            status,
            error,
        });
    }
}

async fn control_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(event);
    }
    tracing::debug!("connection control loop stopped");
}

// ─── Session ─────────────────────────────────────────────────────────────────

enum Phase {
    Ready(String, Vec<ToolDefinition>),
    Failed(String),
    Cancelled,
}

/// One spawned process, from handshake to exit.
struct Session {
    server: String,
    generation: u64,
    started: Instant,
    timeouts: ConnectionTimeouts,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Session {
    async fn run(self, process: SpawnedProcess, mut shutdown: oneshot::Receiver<()>) {
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            mut child,
        } = process;

        let tail = StderrTail::default();
        if let Some(stderr) = stderr {
            drain_stderr(&self.server, stderr, tail.clone());
        }
        let transport = StdioTransport::new(&self.server, stdin, stdout);
        let initialized = AtomicBool::new(false);
        let deadline = tokio::time::Instant::from_std(self.started + self.timeouts.connect_timeout());
        let grace = self.timeouts.shutdown_grace();

        let phase = tokio::select! {
            result = tokio::time::timeout_at(deadline, self.handshake(&transport, &initialized)) => {
                match result {
                    Ok(Ok((version, tools))) => Phase::Ready(version, tools),
                    Ok(Err(e)) => Phase::Failed(e.to_string()),
                    Err(_) => Phase::Failed(McpError::Timeout {
                        server: self.server.clone(),
                        phase: "connect".into(),
                        timeout_ms: self.timeouts.connect_timeout_ms,
                    }.to_string()),
                }
            }
            status = child.wait() => Phase::Failed(exit_reason(&self.server, status)),
            _ = &mut shutdown => Phase::Cancelled,
        };

        match phase {
            Phase::Ready(protocol_version, tools) => {
                let latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
                self.report(ConnectionEvent::Ready {
                    server: self.server.clone(),
                    generation: self.generation,
                    protocol_version,
                    tools,
                    latency_ms,
                });
            }
            Phase::Failed(reason) => {
                let _ = child.start_kill();
                self.report(ConnectionEvent::Failed {
                    server: self.server.clone(),
                    generation: self.generation,
                    error: format!("{reason}{}", tail.suffix()),
                });
                let _ = tokio::time::timeout(grace, child.wait()).await;
                return;
            }
            Phase::Cancelled => {
                if initialized.load(Ordering::SeqCst) {
                    tracing::warn!(server = %self.server, "server disconnected before tool fetch, skipping tools/list");
                } else {
                    tracing::debug!(server = %self.server, "handshake abandoned");
                }
                transport.close_stdin().await;
                terminate(child.as_mut(), grace).await;
                return;
            }
        }

        tokio::select! {
            status = child.wait() => {
                let reason = exit_reason(&self.server, status);
                tracing::warn!(server = %self.server, reason = %reason, "server process exited");
                self.report(ConnectionEvent::Failed {
                    server: self.server.clone(),
                    generation: self.generation,
                    error: format!("{reason}{}", tail.suffix()),
                });
            }
            _ = &mut shutdown => {
                tracing::debug!(server = %self.server, "closing server");
                transport.close_stdin().await;
                terminate(child.as_mut(), grace).await;
            }
        }
    }

    async fn handshake(
        &self,
        transport: &StdioTransport,
        initialized: &AtomicBool,
    ) -> Result<(String, Vec<ToolDefinition>), McpError> {
        let version = handshake::initialize(transport, &self.server).await?;
        initialized.store(true, Ordering::SeqCst);

        // Give the server time to finish registering its tools.
        tokio::time::sleep(self.timeouts.tool_fetch_delay()).await;
        let tools =
            handshake::fetch_tools(transport, &self.server, self.timeouts.tool_fetch_timeout())
                .await?;
        Ok((version, tools))
    }

    fn report(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(server = %self.server, "control loop gone, dropping report");
        }
    }
}

fn exit_reason(server: &str, status: std::io::Result<Option<i32>>) -> String {
    let reason = match status {
        Ok(Some(code)) => format!("process exited with code {code}"),
        Ok(None) => "process terminated by signal".to_string(),
        Err(e) => format!("failed to wait on process: {e}"),
    };
    McpError::ProcessExited {
        server: server.to_string(),
        reason,
    }
    .to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
