//! Settings loading and defaults.
//!
//! Reads `toolhub.yaml` and resolves environment variables. All fields are
//! optional in the file; anything omitted falls back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::SettingsError;

/// Settings file name searched for by [`find_settings_path`].
pub const SETTINGS_FILE_NAME: &str = "toolhub.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level hub settings (mirrors `toolhub.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    /// Directory holding `servers.json`, `registry.sqlite` and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Generic package runner used to launch built-in server kinds.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default)]
    pub connection: ConnectionTimeouts,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
    /// Remote registries polled by the registry sync workflow.
    #[serde(default)]
    pub registries: Vec<RegistrySourceConfig>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            launcher: default_launcher(),
            connection: ConnectionTimeouts::default(),
            concurrency: ConcurrencySettings::default(),
            cache: CacheSettings::default(),
            validation: ValidationSettings::default(),
            registries: Vec::new(),
        }
    }
}

impl HubSettings {
    /// Path of the durable server-config document.
    pub fn servers_path(&self) -> PathBuf {
        self.data_dir.join("servers.json")
    }

    /// Path of the relational registry cache.
    pub fn registry_db_path(&self) -> PathBuf {
        self.data_dir.join("registry.sqlite")
    }

    /// Directory for rotated log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Timeouts and delays for the process layer.
///
/// These were chosen empirically; keep them configurable rather than baking
/// them into the state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionTimeouts {
    /// Ceiling for spawn → ready. The process is killed on expiry.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pause between `initialize` and `tools/list`.
    #[serde(default = "default_tool_fetch_delay_ms")]
    pub tool_fetch_delay_ms: u64,
    /// Ceiling for the `tools/list` response; expiry yields an empty list.
    #[serde(default = "default_tool_fetch_timeout_ms")]
    pub tool_fetch_timeout_ms: u64,
    /// Ceiling for a one-shot connectivity test.
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    /// Grace period after closing stdin before the process is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            tool_fetch_delay_ms: default_tool_fetch_delay_ms(),
            tool_fetch_timeout_ms: default_tool_fetch_timeout_ms(),
            test_timeout_ms: default_test_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ConnectionTimeouts {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tool_fetch_delay(&self) -> Duration {
        Duration::from_millis(self.tool_fetch_delay_ms)
    }

    pub fn tool_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_fetch_timeout_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Bounded-parallelism defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Base delay between retries (doubles per attempt).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Registry cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: u64,
    #[serde(default = "default_max_search_entries")]
    pub max_search_entries: usize,
    #[serde(default = "default_sync_success_interval_secs")]
    pub sync_success_interval_secs: u64,
    #[serde(default = "default_sync_retry_interval_secs")]
    pub sync_retry_interval_secs: u64,
    #[serde(default = "default_registry_max_age_secs")]
    pub registry_max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            search_ttl_secs: default_search_ttl_secs(),
            max_search_entries: default_max_search_entries(),
            sync_success_interval_secs: default_sync_success_interval_secs(),
            sync_retry_interval_secs: default_sync_retry_interval_secs(),
            registry_max_age_secs: default_registry_max_age_secs(),
        }
    }
}

/// Config-validator tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationSettings {
    /// How long a validation result is memoized per `(id, settings)`.
    #[serde(default = "default_validation_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_validation_cache_ttl_secs(),
        }
    }
}

/// A remote registry listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySourceConfig {
    pub name: String,
    pub url: String,
}

fn default_data_dir() -> PathBuf {
    crate::data_dir()
}

/// Platform-correct package runner.
///
/// Windows requires `npx.cmd` because `npx` is a batch script.
pub fn default_launcher() -> String {
    if cfg!(target_os = "windows") {
        "npx.cmd".to_string()
    } else {
        "npx".to_string()
    }
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_tool_fetch_delay_ms() -> u64 {
    5_000
}
fn default_tool_fetch_timeout_ms() -> u64 {
    3_000
}
fn default_test_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}
fn default_max_concurrency() -> usize {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_search_ttl_secs() -> u64 {
    30 * 60
}
fn default_max_search_entries() -> usize {
    1000
}
fn default_sync_success_interval_secs() -> u64 {
    60 * 60
}
fn default_sync_retry_interval_secs() -> u64 {
    5 * 60
}
fn default_registry_max_age_secs() -> u64 {
    60 * 60
}
fn default_validation_cache_ttl_secs() -> u64 {
    5 * 60
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `toolhub.yaml`.
///
/// Checks `TOOLHUB_CONFIG` first, then searches upward from `start`.
pub fn find_settings_path(start: &Path) -> Result<PathBuf, SettingsError> {
    if let Ok(explicit) = std::env::var("TOOLHUB_CONFIG") {
        let candidate = PathBuf::from(explicit);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(SETTINGS_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(SettingsError::NotFound {
        reason: format!("no {SETTINGS_FILE_NAME} above {}", start.display()),
    })
}

/// Load and parse a settings file.
///
/// Performs `${VAR}` / `${VAR:-default}` interpolation before parsing.
pub fn load_settings(path: &Path) -> Result<HubSettings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SettingsError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    parse_settings(&raw)
}

/// Parse settings from YAML text.
pub fn parse_settings(raw: &str) -> Result<HubSettings, SettingsError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(HubSettings::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| SettingsError::ParseFailed {
        reason: e.to_string(),
    })
}

/// Resolve settings for the current process: file if present, else defaults.
pub fn resolve_settings() -> Result<HubSettings, SettingsError> {
    let cwd = std::env::current_dir().unwrap_or_default();
    match find_settings_path(&cwd) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading hub settings");
            load_settings(&path)
        }
        Err(SettingsError::NotFound { .. }) => {
            tracing::debug!("no settings file found, using defaults");
            Ok(HubSettings::default())
        }
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    expand_tilde_values(&result)
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~/` in YAML scalar values (`key: ~/path`).
fn expand_tilde_values(input: &str) -> String {
    input
        .lines()
        .map(|line| match line.split_once(": ~/") {
            Some((key, rest)) => format!("{key}: {}", expand_tilde(&format!("~/{rest}"))),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let settings = HubSettings::default();
        assert_eq!(settings.connection.connect_timeout(), Duration::from_secs(30));
        assert_eq!(settings.connection.tool_fetch_delay(), Duration::from_secs(5));
        assert_eq!(settings.connection.test_timeout(), Duration::from_secs(10));
        assert!(settings.connection.tool_fetch_timeout() < Duration::from_secs(5));
        assert_eq!(settings.concurrency.max_concurrency, 5);
        assert_eq!(settings.cache.search_ttl_secs, 1800);
        assert_eq!(settings.cache.max_search_entries, 1000);
        assert_eq!(settings.validation.cache_ttl_secs, 300);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
            launcher: bunx
            connection:
              tool_fetch_delay_ms: 10
            registries:
              - name: pulse
                url: https://example.invalid/servers
        "#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.launcher, "bunx");
        assert_eq!(settings.connection.tool_fetch_delay_ms, 10);
        assert_eq!(settings.connection.connect_timeout_ms, 30_000);
        assert_eq!(settings.registries.len(), 1);
        assert_eq!(settings.registries[0].name, "pulse");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings.concurrency.max_concurrency, 5);
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLHUB_TEST_UNSET__");
        let result = interpolate_env_vars("data_dir: ${__TOOLHUB_TEST_UNSET__:-/srv/toolhub}");
        assert_eq!(result, "data_dir: /srv/toolhub");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLHUB_TEST_SET__", "/opt/hub");
        let result = interpolate_env_vars("data_dir: ${__TOOLHUB_TEST_SET__:-/srv/toolhub}");
        assert_eq!(result, "data_dir: /opt/hub");
        std::env::remove_var("__TOOLHUB_TEST_SET__");
    }

    #[test]
    fn test_tilde_value_is_expanded() {
        let result = interpolate_env_vars("data_dir: ~/toolhub");
        assert!(!result.contains('~'));
        assert!(result.ends_with("/toolhub"));
    }

    #[test]
    fn test_derived_paths() {
        let settings = parse_settings("data_dir: /tmp/hub").unwrap();
        assert_eq!(settings.servers_path(), PathBuf::from("/tmp/hub/servers.json"));
        assert_eq!(
            settings.registry_db_path(),
            PathBuf::from("/tmp/hub/registry.sqlite")
        );
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = parse_settings("connection: [not, a, map]").unwrap_err();
        assert!(matches!(err, SettingsError::ParseFailed { .. }));
    }
}
