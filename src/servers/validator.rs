//! Server-config validation with remediation guidance.
//!
//! Validation is pure apart from filesystem and command-existence probes.
//! Results are memoized per `(id, serialized settings)` for a short TTL so a
//! settings form re-validating on every keystroke does not repeat the I/O.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::types::{
    CustomSettings, FilesystemSettings, GithubSettings, PostgresSettings, ServerConfig,
    ServerSettings, SqliteSettings,
};
use crate::mcp_client::launch::looks_like_package;
use crate::settings::HubSettings;

// ─── Result Types ────────────────────────────────────────────────────────────

/// Machine-readable error code attached to every blocking validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    Required,
    PathNotFound,
    NotADirectory,
    IsADirectory,
    InvalidTokenFormat,
    InvalidName,
    InvalidPort,
    ParentNotFound,
    ParentNotWritable,
    CommandNotFound,
    CommandNotExecutable,
    InvalidArgs,
    InvalidEnvName,
    InvalidEnvValue,
    CwdNotFound,
    CwdNotADirectory,
    LauncherNotFound,
    UnknownKind,
    InvalidDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: ValidationCode,
    pub remediation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: String,
}

/// Outcome of validating one server config.
///
/// `valid` is always `errors.is_empty()`; warnings never block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<ValidationError>, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn has_code(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    /// Single-line summary of the blocking errors.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Accumulates findings in order.
#[derive(Default)]
struct Report {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
}

impl Report {
    fn error(&mut self, field: &str, code: ValidationCode, message: String, remediation: &str) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message,
            code,
            remediation: remediation.to_string(),
        });
    }

    fn warn(&mut self, field: &str, message: String, suggestion: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message,
            suggestion: suggestion.to_string(),
        });
    }

    fn require(&mut self, field: &str, value: &str, what: &str) -> bool {
        if value.trim().is_empty() {
            self.error(
                field,
                ValidationCode::Required,
                format!("{what} is required"),
                &format!("Provide a value for '{field}'."),
            );
            return false;
        }
        true
    }

    fn finish(self) -> ValidationResult {
        ValidationResult::from_parts(self.errors, self.warnings)
    }
}

// ─── Patterns ────────────────────────────────────────────────────────────────

static GITHUB_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:gh[pousr]_[A-Za-z0-9]{36,}|github_pat_[A-Za-z0-9_]{22,}|[0-9a-f]{40})$")
        .expect("static regex")
});

static GITHUB_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$").expect("static regex")
});

static ENV_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

const KNOWN_KINDS: &[&str] = &["filesystem", "github", "postgres", "sqlite", "custom"];

// ─── Validator ───────────────────────────────────────────────────────────────

pub struct ConfigValidator {
    /// Package runner that built-in kinds launch through.
    launcher: String,
    cache_ttl: Duration,
    memo: Mutex<HashMap<(String, String), (Instant, ValidationResult)>>,
}

impl ConfigValidator {
    pub fn new(launcher: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            launcher: launcher.into(),
            cache_ttl,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &HubSettings) -> Self {
        Self::new(
            settings.launcher.clone(),
            Duration::from_secs(settings.validation.cache_ttl_secs),
        )
    }

    pub fn launcher(&self) -> &str {
        &self.launcher
    }

    /// Validate a typed config, serving a memoized result when one is fresh.
    pub fn validate(&self, config: &ServerConfig) -> ValidationResult {
        let key = (
            config.id.clone(),
            serde_json::to_string(&(&config.settings, &config.protocol_version))
                .unwrap_or_default(),
        );

        if let Some(hit) = self.cached(&key) {
            return hit;
        }

        let result = self.validate_uncached(config);
        if let Ok(mut memo) = self.memo.lock() {
            let ttl = self.cache_ttl;
            memo.retain(|_, (at, _)| at.elapsed() < ttl);
            memo.insert(key, (Instant::now(), result.clone()));
        }
        result
    }

    /// Drop all memoized results.
    pub fn clear_cache(&self) {
        if let Ok(mut memo) = self.memo.lock() {
            memo.clear();
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<ValidationResult> {
        let memo = self.memo.lock().ok()?;
        let (at, result) = memo.get(key)?;
        (at.elapsed() < self.cache_ttl).then(|| result.clone())
    }

    fn validate_uncached(&self, config: &ServerConfig) -> ValidationResult {
        let mut report = Report::default();
        report.require("name", &config.name, "Server name");

        match &config.settings {
            ServerSettings::Filesystem(fs) => validate_filesystem(fs, &mut report),
            ServerSettings::Github(gh) => validate_github(gh, &mut report),
            ServerSettings::Postgres(pg) => validate_postgres(pg, &mut report),
            ServerSettings::Sqlite(sqlite) => validate_sqlite(sqlite, &mut report),
            ServerSettings::Custom(custom) => self.validate_custom(custom, &mut report),
        }

        let needs_launcher = match &config.settings {
            ServerSettings::Custom(custom) => looks_like_package(&custom.command),
            _ => true,
        };
        if needs_launcher {
            self.validate_launcher(&mut report);
        }

        if !check_protocol_compatibility(config.protocol_version.as_deref()) {
            report.warn(
                "protocolVersion",
                "the server reported an empty protocol version at its last handshake".into(),
                "Update the server to a release that implements the MCP initialize handshake.",
            );
        }

        let result = report.finish();
        tracing::debug!(
            server = %config.id,
            kind = %config.kind(),
            valid = result.valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "validated server config"
        );
        result
    }

    /// Validate an untyped document (as submitted by a settings form).
    ///
    /// Structural problems that a typed parse would either reject or silently
    /// coerce are reported with field-scoped codes first.
    pub fn validate_json(&self, raw: &serde_json::Value) -> ValidationResult {
        let mut report = Report::default();

        let Some(config) = raw.get("config").and_then(|c| c.as_object()) else {
            report.error(
                "config",
                ValidationCode::Required,
                "server settings object is required".into(),
                "Provide a 'config' object with a 'type' field.",
            );
            return report.finish();
        };

        let kind = config.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if !KNOWN_KINDS.contains(&kind) {
            report.error(
                "config.type",
                ValidationCode::UnknownKind,
                format!("unknown server type '{kind}'"),
                "Use one of: filesystem, github, postgres, sqlite, custom.",
            );
            return report.finish();
        }

        if kind == "custom" {
            if let Some(args) = config.get("args") {
                let all_strings = args
                    .as_array()
                    .map(|a| a.iter().all(|v| v.is_string()));
                if all_strings != Some(true) {
                    report.error(
                        "args",
                        ValidationCode::InvalidArgs,
                        "arguments must be an array of strings".into(),
                        "Provide args as a JSON array, e.g. [\"--port\", \"8080\"].",
                    );
                }
            }
            if let Some(env) = config.get("env") {
                match env.as_object() {
                    Some(map) => {
                        for (name, value) in map {
                            if !value.is_string() {
                                report.error(
                                    &format!("env.{name}"),
                                    ValidationCode::InvalidEnvValue,
                                    format!("environment value for '{name}' must be a string"),
                                    "Quote the value so it is a JSON string.",
                                );
                            }
                        }
                    }
                    None => report.error(
                        "env",
                        ValidationCode::InvalidEnvValue,
                        "environment must be an object of string values".into(),
                        "Provide env as a JSON object, e.g. {\"API_KEY\": \"...\"}.",
                    ),
                }
            }
        }

        if !report.errors.is_empty() {
            return report.finish();
        }

        match serde_json::from_value::<ServerConfig>(raw.clone()) {
            Ok(config) => self.validate(&config),
            Err(e) => {
                report.error(
                    "config",
                    ValidationCode::InvalidDocument,
                    format!("invalid server config: {e}"),
                    "Check that 'id', 'name' and 'config' are present and well-formed.",
                );
                report.finish()
            }
        }
    }

    fn validate_custom(&self, custom: &CustomSettings, report: &mut Report) {
        if report.require("command", &custom.command, "Command") {
            if !looks_like_package(&custom.command) {
                check_command(&custom.command, report);
            }
        }

        for name in custom.env.keys() {
            if !ENV_NAME_RE.is_match(name) {
                report.error(
                    &format!("env.{name}"),
                    ValidationCode::InvalidEnvName,
                    format!("'{name}' is not a valid environment variable name"),
                    "Use letters, digits and underscores, not starting with a digit.",
                );
            }
        }

        if let Some(cwd) = custom.cwd.as_deref().filter(|c| !c.trim().is_empty()) {
            let path = Path::new(cwd);
            if !path.exists() {
                report.error(
                    "cwd",
                    ValidationCode::CwdNotFound,
                    format!("working directory '{cwd}' does not exist"),
                    "Create the directory or choose an existing one.",
                );
            } else if !path.is_dir() {
                report.error(
                    "cwd",
                    ValidationCode::CwdNotADirectory,
                    format!("working directory '{cwd}' is not a directory"),
                    "Point the working directory at a folder, not a file.",
                );
            }
        }
    }

    fn validate_launcher(&self, report: &mut Report) {
        if which::which(&self.launcher).is_err() {
            report.error(
                "launcher",
                ValidationCode::LauncherNotFound,
                format!("package runner '{}' was not found on PATH", self.launcher),
                "Install Node.js (which provides npx) or set 'launcher' in toolhub.yaml.",
            );
        }
    }
}

/// Whether an observed protocol version is acceptable.
///
/// Before a handshake nothing has been observed and the answer is yes; after
/// one, any non-empty version string is accepted.
pub fn check_protocol_compatibility(observed: Option<&str>) -> bool {
    match observed {
        None => true,
        Some(version) => !version.trim().is_empty(),
    }
}

// ─── Per-kind Checks ─────────────────────────────────────────────────────────

fn validate_filesystem(fs: &FilesystemSettings, report: &mut Report) {
    if report.require("rootPath", &fs.root_path, "Root path") {
        let root = Path::new(&fs.root_path);
        if !root.exists() {
            report.error(
                "rootPath",
                ValidationCode::PathNotFound,
                format!("root path '{}' does not exist", fs.root_path),
                "Create the directory or pick an existing one.",
            );
        } else if !root.is_dir() {
            report.error(
                "rootPath",
                ValidationCode::NotADirectory,
                format!("root path '{}' is not a directory", fs.root_path),
                "The filesystem server needs a directory as its root.",
            );
        }
    }

    let lists = [("allowedPaths", &fs.allowed_paths), ("deniedPaths", &fs.denied_paths)];
    for (field, paths) in lists {
        for (i, p) in paths.iter().enumerate() {
            if !Path::new(p).is_absolute() {
                report.warn(
                    &format!("{field}[{i}]"),
                    format!("'{p}' is not an absolute path"),
                    "Use absolute paths so access rules do not depend on the working directory.",
                );
            }
        }
    }
}

fn validate_github(gh: &GithubSettings, report: &mut Report) {
    if report.require("token", &gh.token, "Access token") && !GITHUB_TOKEN_RE.is_match(gh.token.trim())
    {
        report.error(
            "token",
            ValidationCode::InvalidTokenFormat,
            "access token does not look like a GitHub token".into(),
            "Generate a personal access token (ghp_… or github_pat_…) in GitHub settings.",
        );
    }

    for (field, value) in [("owner", &gh.owner), ("repo", &gh.repo)] {
        if let Some(name) = value.as_deref().filter(|v| !v.is_empty()) {
            if !GITHUB_NAME_RE.is_match(name) {
                report.error(
                    field,
                    ValidationCode::InvalidName,
                    format!("'{name}' contains characters not allowed in a {field} name"),
                    "Use only letters, digits, '.', '_' and '-'.",
                );
            }
        }
    }
}

fn validate_postgres(pg: &PostgresSettings, report: &mut Report) {
    report.require("host", &pg.host, "Host");

    match pg.port {
        None => report.error(
            "port",
            ValidationCode::Required,
            "Port is required".into(),
            "Provide a value for 'port' (PostgreSQL defaults to 5432).",
        ),
        Some(port) if !(1..=65535).contains(&port) => report.error(
            "port",
            ValidationCode::InvalidPort,
            format!("port {port} is outside 1-65535"),
            "Use a TCP port between 1 and 65535.",
        ),
        Some(_) => {}
    }

    report.require("database", &pg.database, "Database");
    report.require("username", &pg.username, "Username");

    if pg.password.as_deref().map_or(true, str::is_empty) {
        report.warn(
            "password",
            "no password set".into(),
            "Set a password unless the server uses trust or peer authentication.",
        );
    }
}

fn validate_sqlite(sqlite: &SqliteSettings, report: &mut Report) {
    if !report.require("path", &sqlite.path, "Database path") {
        return;
    }

    let path = Path::new(&sqlite.path);
    if path.is_dir() {
        report.error(
            "path",
            ValidationCode::IsADirectory,
            format!("'{}' is a directory, not a database file", sqlite.path),
            "Point 'path' at a .db or .sqlite file.",
        );
        return;
    }
    if path.exists() {
        return;
    }

    report.warn(
        "path",
        format!("'{}' does not exist", sqlite.path),
        "The database file will be created on first use.",
    );

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_default(),
    };
    match std::fs::metadata(&parent) {
        Err(_) => report.error(
            "path",
            ValidationCode::ParentNotFound,
            format!("parent directory '{}' does not exist", parent.display()),
            "Create the parent directory first.",
        ),
        Ok(meta) if !meta.is_dir() || meta.permissions().readonly() => report.error(
            "path",
            ValidationCode::ParentNotWritable,
            format!("parent directory '{}' is not writable", parent.display()),
            "Choose a location you have write access to.",
        ),
        Ok(_) => {}
    }
}

/// A command must be an existing executable path or resolve on `PATH`.
fn check_command(command: &str, report: &mut Report) {
    let path = Path::new(command);
    let is_path = path.is_absolute() || command.contains('/') || command.contains('\\');

    if !is_path {
        if which::which(command).is_err() {
            report.error(
                "command",
                ValidationCode::CommandNotFound,
                format!("command '{command}' was not found on PATH"),
                "Install the program or give the absolute path to its executable.",
            );
        }
        return;
    }

    if !path.is_file() {
        report.error(
            "command",
            ValidationCode::CommandNotFound,
            format!("command '{command}' does not exist"),
            "Check the path to the executable.",
        );
        return;
    }

    if !is_executable(path) {
        report.error(
            "command",
            ValidationCode::CommandNotExecutable,
            format!("'{command}' is not executable"),
            "Mark the file executable (chmod +x) or point at the real binary.",
        );
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn validator() -> ConfigValidator {
        ConfigValidator::new("sh", Duration::from_secs(300))
    }

    fn config(settings: ServerSettings) -> ServerConfig {
        ServerConfig::new("srv", "Server", settings)
    }

    fn fs_settings(root: &str) -> ServerSettings {
        ServerSettings::Filesystem(FilesystemSettings {
            root_path: root.into(),
            ..Default::default()
        })
    }

    fn field_codes(result: &ValidationResult) -> Vec<(String, ValidationCode)> {
        result
            .errors
            .iter()
            .map(|e| (e.field.clone(), e.code))
            .collect()
    }

    #[test]
    fn test_existing_directory_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let result = validator().validate(&config(fs_settings(dir.path().to_str().unwrap())));
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_missing_root_path_is_required() {
        let result = validator().validate(&config(fs_settings("")));
        assert!(!result.valid);
        let err = &result.errors[0];
        assert_eq!(err.field, "rootPath");
        assert_eq!(err.code, ValidationCode::Required);
        assert!(!err.remediation.is_empty());
    }

    #[test]
    fn test_root_path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = validator().validate(&config(fs_settings(missing.to_str().unwrap())));
        assert!(result.has_code(ValidationCode::PathNotFound));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let result = validator().validate(&config(fs_settings(file.to_str().unwrap())));
        assert!(result.has_code(ValidationCode::NotADirectory));
    }

    #[test]
    fn test_relative_allow_list_is_warning_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings::Filesystem(FilesystemSettings {
            root_path: dir.path().to_string_lossy().into(),
            allowed_paths: vec!["relative/dir".into()],
            denied_paths: vec!["/abs".into()],
        });
        let result = validator().validate(&config(settings));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].field, "allowedPaths[0]");
    }

    #[test]
    fn test_github_token_shape_and_names() {
        let missing = validator().validate(&config(ServerSettings::Github(Default::default())));
        assert_eq!(
            field_codes(&missing),
            vec![("token".to_string(), ValidationCode::Required)]
        );

        let bad = validator().validate(&config(ServerSettings::Github(GithubSettings {
            token: "hunter2".into(),
            owner: Some("bad owner!".into()),
            repo: Some("ok-repo".into()),
        })));
        assert!(bad.has_code(ValidationCode::InvalidTokenFormat));
        assert!(bad
            .errors
            .iter()
            .any(|e| e.field == "owner" && e.code == ValidationCode::InvalidName));

        let good = validator().validate(&config(ServerSettings::Github(GithubSettings {
            token: format!("ghp_{}", "a".repeat(36)),
            owner: Some("octo-org".into()),
            repo: Some("hello.world".into()),
        })));
        assert!(good.valid, "{:?}", good.errors);
    }

    #[test]
    fn test_postgres_required_fields_and_port() {
        let result = validator().validate(&config(ServerSettings::Postgres(Default::default())));
        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["host", "port", "database", "username"]);
        assert!(result.errors.iter().all(|e| !e.remediation.is_empty()));

        let result = validator().validate(&config(ServerSettings::Postgres(PostgresSettings {
            host: "localhost".into(),
            port: Some(70_000),
            database: "app".into(),
            username: "svc".into(),
            password: None,
        })));
        assert_eq!(
            field_codes(&result),
            vec![("port".to_string(), ValidationCode::InvalidPort)]
        );
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].field, "password");
    }

    #[test]
    fn test_sqlite_missing_file_warns_and_checks_parent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("new.db");
        let result = validator().validate(&config(ServerSettings::Sqlite(SqliteSettings {
            path: db.to_string_lossy().into(),
        })));
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.warnings.len(), 1);

        let orphan = dir.path().join("missing-dir").join("new.db");
        let result = validator().validate(&config(ServerSettings::Sqlite(SqliteSettings {
            path: orphan.to_string_lossy().into(),
        })));
        assert!(result.has_code(ValidationCode::ParentNotFound));
    }

    #[test]
    fn test_sqlite_path_that_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = validator().validate(&config(ServerSettings::Sqlite(SqliteSettings {
            path: dir.path().to_string_lossy().into(),
        })));
        assert_eq!(
            field_codes(&result),
            vec![("path".to_string(), ValidationCode::IsADirectory)]
        );
        let encoded = serde_json::to_value(&result.errors[0]).unwrap();
        assert_eq!(encoded["code"], "IS_A_DIRECTORY");
    }

    #[test]
    fn test_custom_command_not_found() {
        let result = validator().validate(&config(ServerSettings::Custom(CustomSettings {
            command: "definitely-not-a-real-command-xyz".into(),
            ..Default::default()
        })));
        assert!(!result.valid);
        assert!(result.has_code(ValidationCode::CommandNotFound));
    }

    #[test]
    fn test_custom_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("GOOD_NAME".to_string(), "1".to_string());
        env.insert("1BAD".to_string(), "2".to_string());
        let result = validator().validate(&config(ServerSettings::Custom(CustomSettings {
            command: "sh".into(),
            args: vec!["-c".into(), "true".into()],
            env,
            cwd: Some(dir.path().join("gone").to_string_lossy().into()),
        })));
        assert_eq!(
            field_codes(&result),
            vec![
                ("env.1BAD".to_string(), ValidationCode::InvalidEnvName),
                ("cwd".to_string(), ValidationCode::CwdNotFound),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_custom_non_executable_path() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let result = validator().validate(&config(ServerSettings::Custom(CustomSettings {
            command: script.to_string_lossy().into(),
            ..Default::default()
        })));
        assert!(result.has_code(ValidationCode::CommandNotExecutable));
    }

    #[test]
    fn test_missing_launcher_blocks_builtin_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ConfigValidator::new("no-such-runner-xyz", Duration::from_secs(300));
        let result = validator.validate(&config(fs_settings(dir.path().to_str().unwrap())));
        assert!(result.has_code(ValidationCode::LauncherNotFound));

        // A plain custom command does not need the launcher.
        let result = validator.validate(&config(ServerSettings::Custom(CustomSettings {
            command: "sh".into(),
            ..Default::default()
        })));
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_validate_json_structural_errors() {
        let v = validator();

        let result = v.validate_json(&json!({"id": "x", "name": "X", "config": {"type": "ftp"}}));
        assert!(result.has_code(ValidationCode::UnknownKind));

        let result = v.validate_json(&json!({
            "id": "x", "name": "X",
            "config": {"type": "custom", "command": "sh", "args": "--flag", "env": {"PORT": 8080}}
        }));
        assert_eq!(
            field_codes(&result),
            vec![
                ("args".to_string(), ValidationCode::InvalidArgs),
                ("env.PORT".to_string(), ValidationCode::InvalidEnvValue),
            ]
        );

        let result = v.validate_json(&json!({
            "id": "x", "name": "X",
            "config": {"type": "custom", "command": "sh", "args": ["-c", "true"]}
        }));
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_results_are_memoized_per_settings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("later");
        let v = validator();
        let cfg = config(fs_settings(root.to_str().unwrap()));

        assert!(!v.validate(&cfg).valid);
        std::fs::create_dir(&root).unwrap();
        // Same id and settings inside the TTL: memoized result.
        assert!(!v.validate(&cfg).valid);

        v.clear_cache();
        assert!(v.validate(&cfg).valid);
    }

    #[test]
    fn test_protocol_compatibility() {
        assert!(check_protocol_compatibility(None));
        assert!(check_protocol_compatibility(Some("2024-11-05")));
        assert!(!check_protocol_compatibility(Some("")));
    }

    #[test]
    fn test_reported_protocol_version_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let v = validator();

        let mut cfg = config(fs_settings(&root));
        cfg.protocol_version = Some("2024-11-05".into());
        let result = v.validate(&cfg);
        assert!(result.warnings.iter().all(|w| w.field != "protocolVersion"));

        cfg.protocol_version = Some("  ".into());
        let result = v.validate(&cfg);
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.field == "protocolVersion"));
    }

    #[test]
    fn test_valid_flag_tracks_errors() {
        let result = validator().validate(&config(fs_settings("")));
        assert_eq!(result.valid, result.errors.is_empty());
        let summary = result.error_summary();
        assert!(summary.contains("rootPath"));
    }
}
