//! Child-process spawning seam.
//!
//! The connection manager never touches `tokio::process` directly; it goes
//! through [`ProcessSpawner`] so tests can substitute in-memory pipes for a
//! real server binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use super::errors::McpError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Maximum stderr characters retained for error messages.
const STDERR_TAIL_LIMIT: usize = 2000;

// ─── Launch Spec ─────────────────────────────────────────────────────────────

/// Fully resolved command line for a server process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// `program arg1 arg2` for log lines. Environment values are not shown.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Handle to a running child process.
pub trait ChildHandle: Send {
    /// Request termination without waiting.
    fn start_kill(&mut self) -> std::io::Result<()>;

    /// Wait for exit. Resolves to the exit code when one is available.
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>>;
}

/// A freshly spawned server with its stdio pipes.
pub struct SpawnedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn ChildHandle>,
}

/// Creates server processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, server: &str, spec: &LaunchSpec) -> Result<SpawnedProcess, McpError>;
}

// ─── Tokio Implementation ────────────────────────────────────────────────────

/// Spawns real OS processes with piped stdio.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessSpawner;

struct TokioChild(Child);

impl ChildHandle for TokioChild {
    fn start_kill(&mut self) -> std::io::Result<()> {
        self.0.start_kill()
    }

    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>> {
        Box::pin(async move { self.0.wait().await.map(|status| status.code()) })
    }
}

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, server: &str, spec: &LaunchSpec) -> Result<SpawnedProcess, McpError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: server.to_string(),
            reason: format!("{}: {e}", spec.program),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            server: server.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            server: server.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        tracing::info!(server, pid = ?child.id(), command = %spec.display(), "spawned server process");

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Box::new(TokioChild(child)),
        })
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Rolling tail of a server's stderr, shared with the drain task.
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<String>>);

impl StderrTail {
    fn append(&self, line: &str) {
        let mut tail = self.0.lock().unwrap_or_else(|e| e.into_inner());
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_LIMIT {
            let mut cut = tail.len() - STDERR_TAIL_LIMIT;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).trim().to_string()
    }

    /// ` | stderr: …` suffix for error messages (empty if nothing captured).
    pub fn suffix(&self) -> String {
        let text = self.snapshot();
        if text.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {text}")
        }
    }
}

/// Drain stderr line by line into `tail`, logging each line at debug.
pub fn drain_stderr(server: &str, stderr: BoxedReader, tail: StderrTail) {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {line}");
            tail.append(&line);
        }
    });
}

/// Give a child `grace` to exit on its own, then kill it.
pub async fn terminate(child: &mut dyn ChildHandle, grace: Duration) {
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(grace, child.wait()).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_display_hides_env() {
        let mut spec = LaunchSpec {
            program: "npx".into(),
            args: vec!["-y".into(), "pkg".into()],
            ..Default::default()
        };
        spec.env.insert("TOKEN".into(), "secret".into());
        assert_eq!(spec.display(), "npx -y pkg");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::default();
        for i in 0..500 {
            tail.append(&format!("line {i} é"));
        }
        let snapshot = tail.snapshot();
        assert!(snapshot.len() <= STDERR_TAIL_LIMIT);
        assert!(snapshot.ends_with("line 499 é"));
        assert!(tail.suffix().starts_with(" | stderr: "));
    }

    #[test]
    fn test_empty_tail_has_no_suffix() {
        assert_eq!(StderrTail::default().suffix(), "");
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let spec = LaunchSpec {
            program: "definitely-not-a-real-binary-xyz".into(),
            ..Default::default()
        };
        let result = TokioProcessSpawner.spawn("ghost", &spec);
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_stubborn_process() {
        let spec = LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            ..Default::default()
        };
        let mut process = TokioProcessSpawner.spawn("sleeper", &spec).unwrap();
        let started = std::time::Instant::now();
        terminate(process.child.as_mut(), Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
