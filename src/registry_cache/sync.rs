//! Remote registry sync: fetch listings, normalise them, bulk-write them
//! through the cache and record the outcome per registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::errors::SyncError;
use super::manager::CacheManager;
use super::types::{CachedServerRecord, InstallCommand, SyncDetails, SyncState};
use crate::settings::{HubSettings, RegistrySourceConfig};

/// Package names some registries list that do not resolve to a server.
const INVALID_PACKAGES: &[&str] = &["bitcoin-mcp", "mcp-notes"];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest pause between background sync passes.
const MIN_SYNC_PAUSE: Duration = Duration::from_secs(1);

/// What a registry returned for one fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A full listing, with the validator to send next time.
    Listing {
        records: Vec<CachedServerRecord>,
        etag: Option<String>,
    },
    /// The listing matches the validator we sent.
    NotModified,
}

/// A remote listing of tool servers.
pub trait RegistrySource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the listing. `etag` is the validator stored by the last full
    /// fetch; sources that understand it may answer `NotModified`.
    fn fetch<'a>(&'a self, etag: Option<&'a str>) -> BoxFuture<'a, Result<FetchOutcome, SyncError>>;
}

/// Registry listing served as JSON over HTTP.
pub struct HttpRegistrySource {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl HttpRegistrySource {
    pub fn new(config: &RegistrySourceConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Http {
                registry: config.name.clone(),
                reason: format!("HTTP client error: {e}"),
            })?;
        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            http,
        })
    }
}

impl RegistrySource for HttpRegistrySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(&'a self, etag: Option<&'a str>) -> BoxFuture<'a, Result<FetchOutcome, SyncError>> {
        Box::pin(async move {
            let http_err = |e: reqwest::Error| SyncError::Http {
                registry: self.name.clone(),
                reason: e.to_string(),
            };
            let mut request = self
                .http
                .get(&self.url)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(etag) = etag {
                request = request.header(reqwest::header::IF_NONE_MATCH, etag);
            }
            let response = request.send().await.map_err(http_err)?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_MODIFIED {
                tracing::debug!(registry = %self.name, "registry listing not modified");
                return Ok(FetchOutcome::NotModified);
            }
            if !status.is_success() {
                return Err(SyncError::Status {
                    registry: self.name.clone(),
                    status: status.as_u16(),
                });
            }

            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let payload: Value = response.json().await.map_err(|e| SyncError::Decode {
                registry: self.name.clone(),
                reason: e.to_string(),
            })?;
            Ok(FetchOutcome::Listing {
                records: normalize_listing(&self.name, payload, Utc::now()),
                etag,
            })
        })
    }
}

// ─── Normalisation ──────────────────────────────────────────────────────────

/// Normalise a listing payload (`[...]` or `{"servers": [...]}`).
/// Entries without a usable id or name are dropped.
pub fn normalize_listing(registry: &str, payload: Value, now: DateTime<Utc>) -> Vec<CachedServerRecord> {
    let entries = match payload {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("servers") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::Object(map) => normalize_entry(registry, &map, now),
            _ => None,
        })
        .collect()
}

fn str_field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn u64_field(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        let value = map.get(*key)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_entry(
    registry: &str,
    raw: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Option<CachedServerRecord> {
    let id = str_field(raw, &["id", "name", "package_name", "packageName"])?.to_string();
    let name = str_field(raw, &["name"]).unwrap_or(&id).to_string();

    let package_registry =
        str_field(raw, &["package_registry", "packageRegistry"]).map(str::to_string);
    let package_name = str_field(raw, &["package_name", "packageName"])
        .filter(|p| !INVALID_PACKAGES.contains(p))
        .filter(|p| package_registry.as_deref() != Some("npm") || is_valid_npm_package_name(p))
        .map(str::to_string);

    let repository = str_field(raw, &["source_code_url", "repository"])
        .or_else(|| {
            raw.get("repository")
                .and_then(|r| r.get("url"))
                .and_then(Value::as_str)
        })
        .map(|url| normalize_github_url(url).unwrap_or_else(|| url.to_string()));

    let mut tags = string_list(raw.get("tags"));
    if tags.is_empty() {
        tags = string_list(raw.get("keywords"));
    }

    let install_command = explicit_install_command(raw).unwrap_or_else(|| {
        derive_install_command(
            &name,
            package_registry.as_deref(),
            package_name.as_deref(),
            repository.as_deref(),
        )
    });

    let updated_at = str_field(raw, &["updated_at", "updatedAt"])
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);

    Some(CachedServerRecord {
        id,
        name,
        description: str_field(raw, &["short_description", "description"])
            .unwrap_or_default()
            .to_string(),
        author: str_field(raw, &["author"]).map(str::to_string),
        package_name,
        package_registry,
        repository,
        registry: registry.to_string(),
        tags,
        rating: raw.get("rating").and_then(Value::as_f64),
        install_count: u64_field(
            raw,
            &["package_download_count", "downloads", "install_count", "installCount"],
        ),
        github_stars: u64_field(raw, &["github_stars", "githubStars"]),
        install_command: Some(install_command),
        updated_at,
        is_active: true,
        last_fetched_at: None,
        metrics_stale: false,
    })
}

/// `config.command` / `config.args` / `config.env` given by the listing.
fn explicit_install_command(raw: &Map<String, Value>) -> Option<InstallCommand> {
    let config = raw.get("config")?.as_object()?;
    let command = config.get("command")?.as_str()?.trim();
    if command.is_empty() {
        return None;
    }
    let env: BTreeMap<String, String> = config
        .get("env")
        .and_then(Value::as_object)
        .map(|env| {
            env.iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default();
    Some(InstallCommand {
        command: command.to_string(),
        args: string_list(config.get("args")),
        env,
    })
}

fn derive_install_command(
    name: &str,
    package_registry: Option<&str>,
    package_name: Option<&str>,
    repository: Option<&str>,
) -> InstallCommand {
    let command = |command: &str, args: Vec<String>| InstallCommand {
        command: command.to_string(),
        args,
        env: BTreeMap::new(),
    };
    match (package_registry, package_name) {
        (Some("npm"), Some(package)) => command("npx", vec!["-y".into(), package.into()]),
        (Some("pypi"), Some(package)) => command("uvx", vec![package.into()]),
        _ => match repository.and_then(github_repo_segment) {
            Some(segment) => command("npx", vec!["-y".into(), format!("github:{segment}")]),
            None => command(
                "echo",
                vec![format!("Server {name} is missing install information")],
            ),
        },
    }
}

/// `owner/repo` of a GitHub URL in any of its common spellings.
fn github_repo_segment(url: &str) -> Option<String> {
    normalize_github_url(url)?
        .strip_prefix("https://github.com/")
        .map(str::to_string)
}

/// Canonical `https://github.com/owner/repo` form, if `input` names a
/// GitHub repository.
pub fn normalize_github_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let segment = if let Some(rest) = trimmed.strip_prefix("github:") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if let Some(index) = trimmed.find("github.com/") {
        &trimmed[index + "github.com/".len()..]
    } else if !trimmed.contains("://") && trimmed.contains('/') {
        trimmed
    } else {
        return None;
    };

    let mut parts = segment.split('/').map(str::trim).filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");
    Some(format!("https://github.com/{owner}/{repo}"))
}

/// npm names: lower-case `[a-z0-9._-]`, optionally `@scope/name`.
pub fn is_valid_npm_package_name(name: &str) -> bool {
    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
    }

    match name.strip_prefix('@') {
        Some(rest) => match rest.split_once('/') {
            Some((scope, package)) => valid_segment(scope) && valid_segment(package),
            None => false,
        },
        None => valid_segment(name),
    }
}

// ─── Sync service ───────────────────────────────────────────────────────────

/// Result of syncing one registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub registry: String,
    /// `None` when the registry was fresh and skipped.
    pub status: Option<SyncState>,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    /// The registry answered that nothing changed since the last listing.
    pub not_modified: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct RegistrySyncService {
    cache: Arc<CacheManager>,
    sources: Vec<Arc<dyn RegistrySource>>,
    max_age: Duration,
}

impl RegistrySyncService {
    pub fn new(
        cache: Arc<CacheManager>,
        sources: Vec<Arc<dyn RegistrySource>>,
        max_age: Duration,
    ) -> Self {
        Self {
            cache,
            sources,
            max_age,
        }
    }

    /// HTTP sources for every configured registry.
    pub fn from_settings(cache: Arc<CacheManager>, settings: &HubSettings) -> Self {
        let sources = settings
            .registries
            .iter()
            .filter_map(|config| match HttpRegistrySource::new(config) {
                Ok(source) => Some(Arc::new(source) as Arc<dyn RegistrySource>),
                Err(e) => {
                    tracing::warn!(registry = %config.name, error = %e, "registry source disabled");
                    None
                }
            })
            .collect();
        Self::new(
            cache,
            sources,
            Duration::from_secs(settings.cache.registry_max_age_secs),
        )
    }

    pub fn registries(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Sync every registry; fresh ones are skipped unless `force`.
    pub async fn sync_all(&self, force: bool) -> Vec<SyncOutcome> {
        futures::future::join_all(
            self.sources
                .iter()
                .map(|source| self.sync_registry(source.as_ref(), force)),
        )
        .await
    }

    async fn sync_registry(&self, source: &dyn RegistrySource, force: bool) -> SyncOutcome {
        let registry = source.name().to_string();
        let started = Instant::now();
        let mut outcome = SyncOutcome {
            registry: registry.clone(),
            status: None,
            fetched: 0,
            written: 0,
            skipped: 0,
            not_modified: false,
            error: None,
            duration_ms: 0,
        };

        let previous = self.cache.get_registry_sync(&registry);
        let last_failed = previous
            .as_ref()
            .is_some_and(|sync| sync.status == SyncState::Error);
        if !force && !last_failed && self.cache.is_registry_fresh(&registry, self.max_age) {
            tracing::debug!(registry = %registry, "registry is fresh, skipping sync");
            return outcome;
        }

        let etag = previous.and_then(|sync| sync.etag);
        self.cache
            .update_registry_sync(&registry, SyncState::Syncing, SyncDetails::default());

        let stored = match source.fetch(etag.as_deref()).await {
            Ok(FetchOutcome::NotModified) => {
                outcome.not_modified = true;
                Ok(SyncDetails::default())
            }
            Ok(FetchOutcome::Listing { records, etag }) => {
                outcome.fetched = records.len();
                match self.cache.try_bulk_cache_servers(&records) {
                    Ok(summary) => {
                        outcome.written = summary.written;
                        outcome.skipped = summary.skipped;
                        Ok(SyncDetails {
                            server_count: Some(records.len()),
                            etag,
                            ..SyncDetails::default()
                        })
                    }
                    Err(e) => Err(format!("cache write failed: {e}")),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        match stored {
            Ok(details) => {
                self.cache.update_registry_sync(
                    &registry,
                    SyncState::Success,
                    SyncDetails {
                        duration_ms: Some(outcome.duration_ms),
                        ..details
                    },
                );
                tracing::info!(
                    registry = %registry,
                    fetched = outcome.fetched,
                    written = outcome.written,
                    skipped = outcome.skipped,
                    not_modified = outcome.not_modified,
                    duration_ms = outcome.duration_ms,
                    "registry sync succeeded"
                );
                outcome.status = Some(SyncState::Success);
            }
            Err(error) => {
                self.cache.update_registry_sync(
                    &registry,
                    SyncState::Error,
                    SyncDetails {
                        error_message: Some(error.clone()),
                        duration_ms: Some(outcome.duration_ms),
                        ..SyncDetails::default()
                    },
                );
                tracing::warn!(registry = %registry, error = %error, "registry sync failed");
                outcome.status = Some(SyncState::Error);
                outcome.error = Some(error);
            }
        }
        outcome
    }

    /// How long to wait before the next pass: until the earliest upcoming
    /// `next_sync_at` among our registries, at most `interval`. Times already
    /// past belong to registries the last pass skipped as fresh.
    fn next_pause(&self, interval: Duration) -> Duration {
        let now = self.cache.now();
        let names = self.registries();
        self.cache
            .list_registry_syncs()
            .into_iter()
            .filter(|sync| names.contains(&sync.registry.as_str()))
            .filter_map(|sync| sync.next_sync_at)
            .filter_map(|at| at.signed_duration_since(now).to_std().ok())
            .min()
            .unwrap_or(interval)
            .clamp(MIN_SYNC_PAUSE, interval.max(MIN_SYNC_PAUSE))
    }

    /// Run [`sync_all`](Self::sync_all) now, then again whenever a registry
    /// is due (a failed one after the retry interval), at least every
    /// `interval`, until the returned handle is aborted.
    pub fn spawn_background_sync(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let outcomes = self.sync_all(false).await;
                let failed = outcomes
                    .iter()
                    .filter(|o| o.status == Some(SyncState::Error))
                    .count();
                let pause = self.next_pause(interval);
                tracing::debug!(
                    registries = outcomes.len(),
                    failed,
                    next_in_secs = pause.as_secs(),
                    "background registry sync pass"
                );
                tokio::time::sleep(pause).await;
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CacheSettings;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves `payload`, answering 503 for the first `failures` fetches
    /// (every fetch when there is no payload).
    struct StaticSource {
        name: String,
        payload: Option<Value>,
        failures: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn new(name: &str, payload: Option<Value>) -> Arc<Self> {
            Self::flaky(name, payload, 0)
        }

        fn flaky(name: &str, payload: Option<Value>, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                payload,
                failures: AtomicUsize::new(failures),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    impl RegistrySource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch<'a>(
            &'a self,
            _etag: Option<&'a str>,
        ) -> BoxFuture<'a, Result<FetchOutcome, SyncError>> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let failing = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                match &self.payload {
                    Some(payload) if !failing => Ok(FetchOutcome::Listing {
                        records: normalize_listing(&self.name, payload.clone(), Utc::now()),
                        etag: None,
                    }),
                    _ => Err(SyncError::Status {
                        registry: self.name.clone(),
                        status: 503,
                    }),
                }
            })
        }
    }

    fn http_source(name: &str, url: String) -> Arc<dyn RegistrySource> {
        let config = RegistrySourceConfig {
            name: name.into(),
            url,
        };
        Arc::new(HttpRegistrySource::new(&config).unwrap())
    }

    #[test]
    fn test_normalize_listing_maps_fields() {
        let payload = json!({
            "servers": [
                {
                    "name": "Weather",
                    "short_description": "Forecasts",
                    "package_registry": "npm",
                    "package_name": "@acme/weather",
                    "keywords": ["api"],
                    "package_download_count": 1200,
                    "github_stars": 40
                },
                { "id": "  " },
                "not an object"
            ]
        });
        let records = normalize_listing("pulse", payload, Utc::now());
        assert_eq!(records.len(), 1);
        let weather = &records[0];
        assert_eq!(weather.id, "Weather");
        assert_eq!(weather.description, "Forecasts");
        assert_eq!(weather.tags, vec!["api"]);
        assert_eq!(weather.install_count, Some(1200));
        assert_eq!(weather.github_stars, Some(40));
        let install = weather.install_command.as_ref().unwrap();
        assert_eq!(install.command, "npx");
        assert_eq!(install.args, vec!["-y", "@acme/weather"]);
    }

    #[test]
    fn test_install_command_fallbacks() {
        let records = normalize_listing(
            "pulse",
            json!([
                { "id": "py", "package_registry": "pypi", "package_name": "mcp-time" },
                { "id": "gh", "source_code_url": "git@github.com:octo/tools.git" },
                { "id": "bad", "package_registry": "npm", "package_name": "Bad Name" },
                { "id": "notes", "package_registry": "npm", "package_name": "mcp-notes" }
            ]),
            Utc::now(),
        );
        let by_id = |id: &str| records.iter().find(|r| r.id == id).unwrap();

        let py = by_id("py").install_command.clone().unwrap();
        assert_eq!((py.command.as_str(), py.args.clone()), ("uvx", vec!["mcp-time".to_string()]));

        let gh = by_id("gh");
        assert_eq!(gh.repository.as_deref(), Some("https://github.com/octo/tools"));
        assert_eq!(gh.install_command.as_ref().unwrap().args[1], "github:octo/tools");

        assert!(by_id("bad").package_name.is_none());
        assert_eq!(by_id("bad").install_command.as_ref().unwrap().command, "echo");
        assert!(by_id("notes").package_name.is_none());
    }

    #[test]
    fn test_explicit_config_wins() {
        let records = normalize_listing(
            "pulse",
            json!([{
                "id": "x",
                "package_registry": "npm",
                "package_name": "x-server",
                "config": { "command": "node", "args": ["server.js"], "env": { "PORT": 8080 } }
            }]),
            Utc::now(),
        );
        let install = records[0].install_command.clone().unwrap();
        assert_eq!(install.command, "node");
        assert_eq!(install.args, vec!["server.js"]);
        assert_eq!(install.env["PORT"], "8080");
    }

    #[test]
    fn test_npm_name_and_github_url_rules() {
        assert!(is_valid_npm_package_name("@scope/pkg.name"));
        assert!(is_valid_npm_package_name("mcp-server_2"));
        assert!(!is_valid_npm_package_name("@scope"));
        assert!(!is_valid_npm_package_name("Upper"));
        assert!(!is_valid_npm_package_name("@a/b/c"));

        assert_eq!(
            normalize_github_url("https://github.com/o/r.git").as_deref(),
            Some("https://github.com/o/r")
        );
        assert_eq!(
            normalize_github_url("github:o/r").as_deref(),
            Some("https://github.com/o/r")
        );
        assert!(normalize_github_url("https://gitlab.com/o/r").is_none());
    }

    #[tokio::test]
    async fn test_sync_writes_records_and_skips_fresh() {
        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let source = StaticSource::new(
            "pulse",
            Some(json!([
                { "id": "a", "package_registry": "npm", "package_name": "p" },
                { "id": "b", "package_registry": "npm", "package_name": "p" }
            ])),
        );
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![source.clone() as Arc<dyn RegistrySource>],
            Duration::from_secs(3600),
        );

        let outcomes = service.sync_all(false).await;
        assert_eq!(outcomes[0].status, Some(SyncState::Success));
        assert_eq!(outcomes[0].written, 1);
        assert_eq!(outcomes[0].skipped, 1);
        assert!(cache.get_server("a").is_some());
        assert_eq!(cache.get_registry_sync("pulse").unwrap().server_count, 2);

        let again = service.sync_all(false).await;
        assert_eq!(again[0].status, None);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        service.sync_all(true).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_records_error() {
        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![StaticSource::new("down", None) as Arc<dyn RegistrySource>],
            Duration::from_secs(3600),
        );

        let outcomes = service.sync_all(false).await;
        assert_eq!(outcomes[0].status, Some(SyncState::Error));
        assert!(outcomes[0].error.as_deref().unwrap().contains("503"));

        let sync = cache.get_registry_sync("down").unwrap();
        assert_eq!(sync.status, SyncState::Error);
        assert!(sync.next_sync_at.is_some());
        assert!(!cache.is_registry_fresh("down", Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_fresh_registry_is_retried_after_failure() {
        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let source = StaticSource::new("pulse", Some(json!([{ "id": "a" }])));
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![source.clone() as Arc<dyn RegistrySource>],
            Duration::from_secs(3600),
        );
        cache.update_registry_sync("pulse", SyncState::Success, SyncDetails::default());
        cache.update_registry_sync("pulse", SyncState::Error, SyncDetails::default());
        assert!(cache.is_registry_fresh("pulse", Duration::from_secs(3600)));

        let outcomes = service.sync_all(false).await;
        assert_eq!(outcomes[0].status, Some(SyncState::Success));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unwritable_cache_records_error() {
        let cache = Arc::new(CacheManager::unavailable(CacheSettings::default()));
        let service = RegistrySyncService::new(
            cache,
            vec![StaticSource::new("pulse", Some(json!([{ "id": "a" }]))) as Arc<dyn RegistrySource>],
            Duration::from_secs(3600),
        );

        let outcomes = service.sync_all(true).await;
        assert_eq!(outcomes[0].status, Some(SyncState::Error));
        assert_eq!(outcomes[0].fetched, 1);
        assert_eq!(outcomes[0].written, 0);
        assert!(outcomes[0].error.as_deref().unwrap().contains("cache write failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sync_retries_after_failure() {
        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let source = StaticSource::flaky("pulse", Some(json!([{ "id": "a" }])), 1);
        let service = Arc::new(RegistrySyncService::new(
            cache.clone(),
            vec![source.clone() as Arc<dyn RegistrySource>],
            Duration::from_secs(3600),
        ));

        let handle = service.spawn_background_sync(Duration::from_secs(3600));
        // The retry interval is 300s; the regular interval is an hour.
        tokio::time::sleep(Duration::from_secs(600)).await;
        handle.abort();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(cache.get_server("a").is_some());
        assert_eq!(cache.get_registry_sync("pulse").unwrap().status, SyncState::Success);
    }

    #[test]
    fn test_next_pause_follows_earliest_upcoming_sync() {
        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![
                StaticSource::new("ok", None) as Arc<dyn RegistrySource>,
                StaticSource::new("down", None) as Arc<dyn RegistrySource>,
            ],
            Duration::from_secs(3600),
        );
        let day = Duration::from_secs(86_400);
        assert_eq!(service.next_pause(day), day);

        cache.update_registry_sync("ok", SyncState::Success, SyncDetails::default());
        // Registries this service does not sync do not shorten the pause.
        cache.update_registry_sync("elsewhere", SyncState::Error, SyncDetails::default());
        let pause = service.next_pause(day);
        assert!(pause > Duration::from_secs(3590) && pause <= Duration::from_secs(3600));

        cache.update_registry_sync("down", SyncState::Error, SyncDetails::default());
        let pause = service.next_pause(day);
        assert!(pause > Duration::from_secs(290) && pause <= Duration::from_secs(300));
        assert_eq!(service.next_pause(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_http_source_revalidates_with_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"listing-1\"")
                    .set_body_json(json!({ "servers": [{ "id": "weather", "rating": 4.5 }] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![http_source("pulse", format!("{}/servers", server.uri()))],
            Duration::from_secs(3600),
        );
        let first = service.sync_all(true).await;
        assert_eq!(first[0].status, Some(SyncState::Success));
        assert_eq!(first[0].written, 1);
        assert_eq!(
            cache.get_registry_sync("pulse").unwrap().etag.as_deref(),
            Some("\"listing-1\"")
        );
        server.verify().await;
        server.reset().await;

        Mock::given(method("GET"))
            .and(path("/servers"))
            .and(header("if-none-match", "\"listing-1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let second = service.sync_all(true).await;
        assert_eq!(second[0].status, Some(SyncState::Success));
        assert!(second[0].not_modified);
        assert_eq!(second[0].fetched, 0);

        let sync = cache.get_registry_sync("pulse").unwrap();
        assert_eq!(sync.status, SyncState::Success);
        assert_eq!(sync.server_count, 1);
        assert_eq!(sync.etag.as_deref(), Some("\"listing-1\""));
        assert_eq!(cache.get_server("weather").unwrap().rating, Some(4.5));
    }

    #[tokio::test]
    async fn test_http_error_marks_cached_metrics_stale() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "weather" }])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = Arc::new(CacheManager::in_memory(CacheSettings::default()));
        let service = RegistrySyncService::new(
            cache.clone(),
            vec![http_source("pulse", server.uri())],
            Duration::from_secs(3600),
        );
        service.sync_all(true).await;
        assert!(!cache.get_server("weather").unwrap().metrics_stale);

        let failed = service.sync_all(true).await;
        assert_eq!(failed[0].status, Some(SyncState::Error));
        assert!(failed[0].error.as_deref().unwrap().contains("500"));
        let record = cache.get_server("weather").unwrap();
        assert!(record.metrics_stale);
        assert_eq!(cache.get_registry_sync("pulse").unwrap().status, SyncState::Error);
    }
}
