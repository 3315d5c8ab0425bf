pub mod concurrency;
pub mod logging;
pub mod mcp_client;
pub mod registry_cache;
pub mod servers;
pub mod settings;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

pub use logging::init_tracing;

use concurrency::{
    BatchConnectResult, BatchConnector, ConcurrencyError, ConcurrencyManager,
    ParallelConnectOptions,
};
use mcp_client::{ConnectionPoolManager, ProcessSpawner, ServerConnectionManager, TokioProcessSpawner};
use registry_cache::{CacheManager, RegistrySource, RegistrySyncService};
use servers::{ConfigError, ConfigStore, ConfigValidator, CustomSettings, ServerConfig, ServerSettings};
use settings::{HubSettings, SettingsError};

/// Return the platform-standard data directory for toolhub.
///
/// - macOS: `~/Library/Application Support/toolhub/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolhub\`
/// - Linux: `$XDG_DATA_HOME/toolhub/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolhub/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolhub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhub")
}

// ─── ToolHub ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("registry server not cached: '{id}'")]
    NotInRegistry { id: String },
}

/// Everything the hub runs, wired together from one `HubSettings`.
///
/// Must be created inside a Tokio runtime.
pub struct ToolHub {
    settings: HubSettings,
    connections: ServerConnectionManager,
    pool: Arc<ConnectionPoolManager>,
    concurrency: Arc<ConcurrencyManager>,
    batch: BatchConnector,
    cache: Arc<CacheManager>,
    sync: Arc<RegistrySyncService>,
    background_sync: Mutex<Option<JoinHandle<()>>>,
}

impl ToolHub {
    /// Open the durable config store and registry cache under `data_dir`
    /// and launch servers as real child processes.
    pub fn open(settings: HubSettings) -> Result<Self, HubError> {
        let store = ConfigStore::load(&settings.servers_path(), &settings.data_dir)?;
        let cache = Arc::new(CacheManager::open(
            &settings.registry_db_path(),
            settings.cache.clone(),
        ));
        let sync = RegistrySyncService::from_settings(cache.clone(), &settings);
        Ok(Self::assemble(
            settings,
            Arc::new(store),
            Arc::new(TokioProcessSpawner),
            cache,
            sync,
        ))
    }

    /// Build a hub from explicit parts.
    pub fn with_parts(
        settings: HubSettings,
        store: Arc<ConfigStore>,
        spawner: Arc<dyn ProcessSpawner>,
        cache: Arc<CacheManager>,
        sources: Vec<Arc<dyn RegistrySource>>,
    ) -> Self {
        let sync = RegistrySyncService::new(
            cache.clone(),
            sources,
            Duration::from_secs(settings.cache.registry_max_age_secs),
        );
        Self::assemble(settings, store, spawner, cache, sync)
    }

    fn assemble(
        settings: HubSettings,
        store: Arc<ConfigStore>,
        spawner: Arc<dyn ProcessSpawner>,
        cache: Arc<CacheManager>,
        sync: RegistrySyncService,
    ) -> Self {
        let validator = Arc::new(ConfigValidator::from_settings(&settings));
        let connections =
            ServerConnectionManager::new(store, validator, spawner, settings.connection.clone());
        let pool = Arc::new(ConnectionPoolManager::new(connections.clone()));
        let concurrency = Arc::new(ConcurrencyManager::from_settings(&settings.concurrency));
        let batch = BatchConnector::new(concurrency.clone(), connections.clone(), pool.clone());

        Self {
            settings,
            connections,
            pool,
            concurrency,
            batch,
            cache,
            sync: Arc::new(sync),
            background_sync: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        self.connections.store()
    }

    pub fn validator(&self) -> &Arc<ConfigValidator> {
        self.connections.validator()
    }

    pub fn connections(&self) -> &ServerConnectionManager {
        &self.connections
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    pub fn batch(&self) -> &BatchConnector {
        &self.batch
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn sync(&self) -> &Arc<RegistrySyncService> {
        &self.sync
    }

    /// Connect every enabled server. One failure never stops the others.
    pub async fn connect_enabled_servers(&self) -> Result<Vec<BatchConnectResult>, HubError> {
        let ids: Vec<String> = self
            .store()
            .list()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(count = ids.len(), "connecting enabled servers");
        let results = self
            .batch
            .connect_servers_parallel(
                &ids,
                ParallelConnectOptions {
                    fail_fast: false,
                    ..ParallelConnectOptions::default()
                },
            )
            .await?;

        for result in results.iter().filter(|r| !r.success) {
            tracing::warn!(
                server = %result.server_id,
                error = result.error.as_deref().unwrap_or(""),
                "startup connect failed"
            );
        }
        Ok(results)
    }

    /// Add a cached registry record to the config store as a disabled
    /// custom server. Installing the same record again updates the
    /// existing entry instead of duplicating it.
    pub fn install_from_registry(&self, registry_id: &str) -> Result<ServerConfig, HubError> {
        let record = self
            .cache
            .get_server(registry_id)
            .ok_or_else(|| HubError::NotInRegistry {
                id: registry_id.to_string(),
            })?;
        let install = record.install_command.clone().unwrap_or_default();

        let mut config = ServerConfig::new(
            format!("registry-{}", uuid::Uuid::new_v4()),
            record.name.clone(),
            ServerSettings::Custom(CustomSettings {
                command: install.command,
                args: install.args,
                env: install.env,
                cwd: None,
            }),
        );
        config.enabled = false;
        config.registry_id = Some(record.id.clone());

        if let Some(existing) = self
            .store()
            .list()
            .into_iter()
            .find(|s| s.registry_id.as_deref() == Some(record.id.as_str()))
        {
            config.id = existing.id;
            config.created_at = existing.created_at;
        }

        self.store().upsert(config.clone())?;
        tracing::info!(
            server = %config.id,
            registry_id = %record.id,
            registry = %record.registry,
            "installed server from registry"
        );
        Ok(config)
    }

    /// Run registry sync whenever a registry is due (failed ones after the
    /// retry interval) until shutdown.
    /// A no-op when no registries are configured or the loop already runs.
    pub fn start_background_sync(&self) {
        if self.sync.registries().is_empty() {
            return;
        }
        let Ok(mut slot) = self.background_sync.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.settings.cache.sync_success_interval_secs.max(1));
        *slot = Some(self.sync.clone().spawn_background_sync(interval));
    }

    /// Stop background work and terminate every live server.
    pub async fn shutdown(&self) {
        let handle = self.background_sync.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        let pooled = self.pool.cleanup().await;
        let disconnected = self.connections.disconnect_all().await;
        self.concurrency.shutdown().await;
        tracing::info!(pooled, disconnected, "toolhub shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
