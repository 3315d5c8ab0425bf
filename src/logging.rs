//! Log file management and the global tracing subscriber.
//!
//! Logs go to `<log_dir>/toolhub.log`, shifted into a numbered chain on each
//! start. `std::fs::File` has no user-space buffer, so every formatted event
//! is handed to the OS as soon as it is written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "toolhub.log";
/// Older logs kept next to the live one.
const KEEP_ROTATED: usize = 3;
const DEFAULT_FILTER: &str = "toolhub=info,warn";

/// Where the subscriber ended up writing.
#[derive(Debug)]
pub enum LogSink {
    File { path: PathBuf, rotated: usize },
    Stderr { error: std::io::Error },
}

/// The live log file and its numbered predecessors.
struct LogFiles {
    live: PathBuf,
    keep: usize,
}

impl LogFiles {
    fn new(dir: &Path, keep: usize) -> Self {
        Self {
            live: dir.join(LOG_FILE),
            keep,
        }
    }

    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.live.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Shift `toolhub.log` to `.1`, `.1` to `.2` and so on, dropping the
    /// file past `keep`. Returns how many files moved.
    fn rotate(&self) -> usize {
        if self.keep == 0 {
            return 0;
        }
        let _ = std::fs::remove_file(self.numbered(self.keep));
        let shifted = (1..self.keep)
            .rev()
            .filter(|&n| std::fs::rename(self.numbered(n), self.numbered(n + 1)).is_ok())
            .count();
        shifted + usize::from(std::fs::rename(&self.live, self.numbered(1)).is_ok())
    }

    fn open(&self) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.live)
    }
}

/// Rotate and open the log file in `log_dir`, creating the directory.
fn open_log(log_dir: &Path) -> std::io::Result<(std::fs::File, LogFiles, usize)> {
    std::fs::create_dir_all(log_dir)?;
    let files = LogFiles::new(log_dir, KEEP_ROTATED);
    let rotated = files.rotate();
    let file = files.open()?;
    Ok((file, files, rotated))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Writes to `<log_dir>/toolhub.log`, or stderr when that cannot be opened.
/// A second call leaves the first subscriber in place.
pub fn init_tracing(log_dir: &Path) -> LogSink {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, sink) = match open_log(log_dir) {
        Ok((file, files, rotated)) => (
            BoxMakeWriter::new(Arc::new(file)),
            LogSink::File {
                path: files.live,
                rotated,
            },
        ),
        Err(error) => (BoxMakeWriter::new(std::io::stderr), LogSink::Stderr { error }),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init();

    match &sink {
        LogSink::File { path, rotated } => tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            path = %path.display(),
            rotated,
            "toolhub logging initialised"
        ),
        LogSink::Stderr { error } => tracing::warn!(
            log_dir = %log_dir.display(),
            error = %error,
            "toolhub log directory unusable, logging to stderr"
        ),
    }
    sink
}

// ─── Tests ───────────────────────────────────────────────────────────────────
