//! In-memory tool servers for process-layer tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::connection::ServerConnectionManager;
use super::errors::McpError;
use super::process::{ChildHandle, LaunchSpec, ProcessSpawner, SpawnedProcess};
use super::transport::StdioTransport;
use crate::servers::{
    ConfigStore, ConfigValidator, FilesystemSettings, ServerConfig, ServerSettings, ServerStatus,
};
use crate::settings::ConnectionTimeouts;

/// Behaviour of a scripted server.
#[derive(Debug, Clone)]
pub struct ScriptedServer {
    pub protocol_version: Option<String>,
    pub tools: Vec<String>,
    pub answer_initialize: bool,
    pub answer_tools_list: bool,
    /// Exit with code 1 right after answering `tools/list`.
    pub exit_after_tools: bool,
    /// Exit with this code before reading anything.
    pub exit_immediately: Option<i32>,
    pub pretty: bool,
    pub stderr: Option<String>,
}

impl Default for ScriptedServer {
    fn default() -> Self {
        Self {
            protocol_version: Some("2024-11-05".into()),
            tools: vec!["read_file".into()],
            answer_initialize: true,
            answer_tools_list: true,
            exit_after_tools: false,
            exit_immediately: None,
            pretty: false,
            stderr: None,
        }
    }
}

impl ScriptedServer {
    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    async fn run(
        self,
        stdin: DuplexStream,
        mut stdout: DuplexStream,
        kill: Arc<Notify>,
        exit: watch::Sender<Option<i32>>,
    ) {
        if let Some(code) = self.exit_immediately {
            let _ = exit.send(Some(code));
            return;
        }

        let _ = stdout.write_all(b"scripted server starting\n").await;
        let mut lines = BufReader::new(stdin).lines();
        loop {
            let line = tokio::select! {
                _ = kill.notified() => {
                    let _ = exit.send(Some(-9));
                    return;
                }
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else {
                let _ = exit.send(Some(0));
                return;
            };
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let id = request["id"].clone();
            let reply = match request["method"].as_str() {
                Some("initialize") if self.answer_initialize => {
                    let mut result = json!({ "serverInfo": { "name": "scripted" } });
                    if let Some(version) = &self.protocol_version {
                        result["protocolVersion"] = json!(version);
                    }
                    Some(result)
                }
                Some("tools/list") if self.answer_tools_list => {
                    let tools: Vec<Value> = self
                        .tools
                        .iter()
                        .map(|name| json!({ "name": name, "description": "", "inputSchema": {} }))
                        .collect();
                    Some(json!({ "tools": tools }))
                }
                _ => None,
            };
            let Some(result) = reply else {
                continue;
            };
            let message = json!({ "jsonrpc": "2.0", "id": id, "result": result });
            let text = if self.pretty {
                serde_json::to_string_pretty(&message)
            } else {
                serde_json::to_string(&message)
            }
            .unwrap_or_default();
            let _ = stdout.write_all(format!("{text}\n").as_bytes()).await;

            if self.exit_after_tools && request["method"] == "tools/list" {
                let _ = exit.send(Some(1));
                return;
            }
        }
    }
}

/// Transport connected to a scripted server task.
pub fn spawn_script(script: ScriptedServer) -> (StdioTransport, JoinHandle<()>) {
    let (client_in, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_out) = tokio::io::duplex(64 * 1024);
    let (exit_tx, _exit_rx) = watch::channel(None);
    let handle = tokio::spawn(script.run(server_in, server_out, Arc::new(Notify::new()), exit_tx));
    let transport = StdioTransport::new("fake", Box::new(client_in), Box::new(client_out));
    (transport, handle)
}

struct FakeChild {
    exit: watch::Receiver<Option<i32>>,
    kill: Arc<Notify>,
    killed: Arc<AtomicBool>,
}

impl ChildHandle for FakeChild {
    fn start_kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_one();
        Ok(())
    }

    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>> {
        Box::pin(async move {
            loop {
                if let Some(code) = *self.exit.borrow() {
                    return Ok(Some(code));
                }
                if self.exit.changed().await.is_err() {
                    return Ok(None);
                }
            }
        })
    }
}

/// Spawner that runs [`ScriptedServer`]s over in-memory pipes.
#[derive(Default)]
pub struct FakeSpawner {
    pub script: ScriptedServer,
    pub fail_spawn: bool,
    spawns: AtomicUsize,
    killed: Arc<AtomicBool>,
    specs: Mutex<Vec<LaunchSpec>>,
}

impl FakeSpawner {
    pub fn new(script: ScriptedServer) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// A spawner whose every spawn fails as if the binary were missing.
    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Whether any spawned process has been force-killed.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.specs.lock().ok()?.last().cloned()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, server: &str, spec: &LaunchSpec) -> Result<SpawnedProcess, McpError> {
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }
        if self.fail_spawn {
            return Err(McpError::SpawnFailed {
                server: server.to_string(),
                reason: "No such file or directory".into(),
            });
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let (mut err_writer, err_reader) = tokio::io::duplex(4096);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        if let Some(text) = self.script.stderr.clone() {
            tokio::spawn(async move {
                let _ = err_writer.write_all(text.as_bytes()).await;
            });
        }
        tokio::spawn(self.script.clone().run(server_in, server_out, kill.clone(), exit_tx));

        Ok(SpawnedProcess {
            stdin: Box::new(client_in),
            stdout: Box::new(client_out),
            stderr: Some(Box::new(err_reader)),
            child: Box::new(FakeChild {
                exit: exit_rx,
                kill,
                killed: self.killed.clone(),
            }),
        })
    }
}

/// Timeouts scaled down for tests.
pub fn fast_timeouts() -> ConnectionTimeouts {
    ConnectionTimeouts {
        connect_timeout_ms: 2_000,
        tool_fetch_delay_ms: 10,
        tool_fetch_timeout_ms: 500,
        test_timeout_ms: 1_000,
        shutdown_grace_ms: 50,
    }
}

pub fn filesystem_server(id: &str, root: &std::path::Path) -> ServerConfig {
    ServerConfig::new(
        id,
        id,
        ServerSettings::Filesystem(FilesystemSettings {
            root_path: root.to_string_lossy().to_string(),
            ..FilesystemSettings::default()
        }),
    )
}

/// Manager over an in-memory store, validating with `sh` as the launcher.
pub fn manager_with(
    servers: Vec<ServerConfig>,
    spawner: Arc<FakeSpawner>,
    timeouts: ConnectionTimeouts,
) -> ServerConnectionManager {
    ServerConnectionManager::new(
        Arc::new(ConfigStore::in_memory(servers)),
        Arc::new(ConfigValidator::new("sh", Duration::from_secs(300))),
        spawner,
        timeouts,
    )
}

/// Poll the stored status until it equals `status` (5 s ceiling).
pub async fn wait_for_status(
    manager: &ServerConnectionManager,
    id: &str,
    status: ServerStatus,
) -> bool {
    let poll = async {
        loop {
            if manager.store().get(id).map(|c| c.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll).await.is_ok()
}
