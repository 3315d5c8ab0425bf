//! Launch-spec construction.
//!
//! Built-in kinds resolve to a package-runner invocation of a published
//! server package. Custom servers run their command directly, unless the
//! command names a package rather than a path.

use std::path::PathBuf;

use super::process::LaunchSpec;
use crate::servers::{ServerConfig, ServerSettings};

const FILESYSTEM_PACKAGE: &str = "@modelcontextprotocol/server-filesystem";
const GITHUB_PACKAGE: &str = "@modelcontextprotocol/server-github";
const POSTGRES_PACKAGE: &str = "@modelcontextprotocol/server-postgres";
const SQLITE_PACKAGE: &str = "mcp-server-sqlite-npx";

/// Whether a custom command is a package reference (`@scope/name` or
/// `name@version`) rather than an executable path or bare program name.
pub fn looks_like_package(command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() || command.contains('\\') || command.contains(char::is_whitespace) {
        return false;
    }
    if let Some(rest) = command.strip_prefix('@') {
        return rest.contains('/') && !rest.starts_with('/');
    }
    !command.contains('/') && command.contains('@')
}

/// Build the command line for `config`, using `launcher` for packages.
pub fn build_launch_spec(config: &ServerConfig, launcher: &str) -> LaunchSpec {
    let via_launcher = |package: &str, extra: Vec<String>| {
        let mut args = vec!["-y".to_string(), package.to_string()];
        args.extend(extra);
        LaunchSpec {
            program: launcher.to_string(),
            args,
            ..LaunchSpec::default()
        }
    };

    match &config.settings {
        ServerSettings::Filesystem(fs) => {
            let mut roots = vec![fs.root_path.clone()];
            roots.extend(fs.allowed_paths.iter().filter(|p| **p != fs.root_path).cloned());
            via_launcher(FILESYSTEM_PACKAGE, roots)
        }
        ServerSettings::Github(gh) => {
            let mut spec = via_launcher(GITHUB_PACKAGE, Vec::new());
            spec.env
                .insert("GITHUB_PERSONAL_ACCESS_TOKEN".into(), gh.token.clone());
            if let Some(owner) = &gh.owner {
                spec.env.insert("GITHUB_OWNER".into(), owner.clone());
            }
            if let Some(repo) = &gh.repo {
                spec.env.insert("GITHUB_REPO".into(), repo.clone());
            }
            spec
        }
        ServerSettings::Postgres(pg) => via_launcher(POSTGRES_PACKAGE, vec![pg.connection_url()]),
        ServerSettings::Sqlite(sqlite) => via_launcher(SQLITE_PACKAGE, vec![sqlite.path.clone()]),
        ServerSettings::Custom(custom) => {
            let mut spec = if looks_like_package(&custom.command) {
                via_launcher(custom.command.trim(), custom.args.clone())
            } else {
                LaunchSpec {
                    program: custom.command.clone(),
                    args: custom.args.clone(),
                    ..LaunchSpec::default()
                }
            };
            spec.env = custom.env.clone();
            spec.cwd = custom
                .cwd
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(PathBuf::from);
            spec
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
