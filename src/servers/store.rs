//! Durable server-config store.
//!
//! Server configs live in a JSON array document. Loading resets every status
//! to `disconnected` so a restart never implies reconnection.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use super::errors::ConfigError;
use super::types::{FilesystemSettings, ServerConfig, ServerSettings, ServerStatus};

/// Id of the server seeded into an empty store.
pub const DEFAULT_SERVER_ID: &str = "default-filesystem";

/// Thread-safe, file-backed list of server configs.
///
/// Reads take a shared lock; every mutation holds the write lock through
/// the file write so concurrent writers cannot interleave.
pub struct ConfigStore {
    path: Option<PathBuf>,
    servers: RwLock<Vec<ServerConfig>>,
}

impl ConfigStore {
    /// Load the store from `path`, seeding a default filesystem server rooted
    /// at `default_root` when the file does not exist.
    pub fn load(path: &Path, default_root: &Path) -> Result<Self, ConfigError> {
        let servers = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let mut servers: Vec<ServerConfig> = if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            };
            for server in &mut servers {
                server.status = ServerStatus::Disconnected;
                server.error_message = None;
            }
            tracing::info!(path = %path.display(), count = servers.len(), "loaded server configs");
            servers
        } else {
            tracing::info!(path = %path.display(), "no server config file, seeding default");
            let servers = vec![default_server(default_root)];
            write_document(path, &servers)?;
            servers
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            servers: RwLock::new(servers),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(servers: Vec<ServerConfig>) -> Self {
        Self {
            path: None,
            servers: RwLock::new(servers),
        }
    }

    pub fn list(&self) -> Vec<ServerConfig> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        self.read().iter().find(|s| s.id == id).cloned()
    }

    /// Insert or replace by id, then persist.
    pub fn upsert(&self, config: ServerConfig) -> Result<(), ConfigError> {
        let mut servers = self.write();
        match servers.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => *existing = config,
            None => servers.push(config),
        }
        self.persist_locked(&servers)
    }

    /// Remove by id. Returns whether a server was removed.
    pub fn remove(&self, id: &str) -> Result<bool, ConfigError> {
        let mut servers = self.write();
        let before = servers.len();
        servers.retain(|s| s.id != id);
        if servers.len() == before {
            return Ok(false);
        }
        self.persist_locked(&servers)?;
        Ok(true)
    }

    /// Apply `f` to the server with `id` and persist the result.
    pub fn update<F>(&self, id: &str, f: F) -> Result<ServerConfig, ConfigError>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut servers = self.write();
        let server = servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ConfigError::NotFound { id: id.to_string() })?;
        f(server);
        server.updated_at = Utc::now();
        let updated = server.clone();
        self.persist_locked(&servers)?;
        Ok(updated)
    }

    /// Write the current list to disk.
    pub fn persist(&self) -> Result<(), ConfigError> {
        let servers = self.write();
        self.persist_locked(&servers)
    }

    fn persist_locked(&self, servers: &[ServerConfig]) -> Result<(), ConfigError> {
        match &self.path {
            Some(path) => write_document(path, servers),
            None => Ok(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ServerConfig>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ServerConfig>> {
        self.servers.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn default_server(root: &Path) -> ServerConfig {
    let mut server = ServerConfig::new(
        DEFAULT_SERVER_ID,
        "Local Filesystem",
        ServerSettings::Filesystem(FilesystemSettings {
            root_path: root.to_string_lossy().to_string(),
            ..FilesystemSettings::default()
        }),
    );
    server.enabled = true;
    server
}

/// Write via a sibling temp file and rename so readers never see a torn file.
fn write_document(path: &Path, servers: &[ServerConfig]) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let serialized = serde_json::to_string_pretty(servers)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serialized).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
