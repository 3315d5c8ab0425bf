use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use toolhub::registry_cache::{SearchOptions, SortBy, SortOrder};
use toolhub::servers::ServerStatus;
use toolhub::settings::config::resolve_settings;
use toolhub::ToolHub;

#[derive(Parser)]
#[command(name = "toolhub")]
#[command(about = "Manage and inspect MCP tool servers", long_about = None)]
struct Cli {
    /// Override the data directory from toolhub.yaml
    #[arg(long, env = "TOOLHUB_DATA_DIR", global = true)]
    data_dir: Option<std::path::PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,

    /// Validate one server's configuration
    Validate {
        /// Server id
        id: String,
    },

    /// Connect to a server and wait for its tools
    Connect {
        /// Server id
        id: String,

        /// Seconds to wait for the handshake to finish
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },

    /// Search cached registry listings
    Search {
        /// Free-text query
        query: Option<String>,

        /// Require a tag (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,

        /// Restrict to one registry
        #[arg(short, long)]
        registry: Option<String>,

        /// Sort by rating, highest first
        #[arg(long)]
        top_rated: bool,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short = 'o', long, default_value_t = 0)]
        offset: usize,
    },

    /// Install a cached registry listing as a disabled custom server
    Install {
        /// Registry record id
        registry_id: String,
    },

    /// Sync every configured registry into the cache
    Sync {
        /// Sync even registries that are still fresh
        #[arg(long)]
        force: bool,
    },

    /// Show cache, pool and concurrency figures
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = resolve_settings().context("failed to load toolhub settings")?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    toolhub::init_tracing(&settings.log_dir());

    let hub = ToolHub::open(settings).context("failed to open toolhub data directory")?;
    let outcome = run(&hub, cli.command, cli.json).await;
    hub.shutdown().await;
    outcome
}

async fn run(hub: &ToolHub, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Servers => {
            let servers = hub.store().list();
            if json {
                return print_json(&servers);
            }
            for server in servers {
                println!(
                    "{:<24} {:<14} {:<12} {}",
                    server.id,
                    server.kind(),
                    server.status,
                    if server.enabled { "enabled" } else { "disabled" }
                );
            }
        }

        Commands::Validate { id } => {
            let config = hub
                .store()
                .get(&id)
                .with_context(|| format!("unknown server: '{id}'"))?;
            let result = hub.validator().validate(&config);
            if json {
                return print_json(&result);
            }
            for error in &result.errors {
                println!("error   {}: {}", error.field, error.message);
                println!("        fix: {}", error.remediation);
            }
            for warning in &result.warnings {
                println!("warning {}: {}", warning.field, warning.message);
            }
            if !result.valid {
                bail!("server '{id}' is not valid");
            }
            println!("server '{id}' is valid");
        }

        Commands::Connect { id, wait } => {
            let mut changes = hub.connections().subscribe();
            let result = hub.connections().connect(&id).await;
            if !result.success {
                bail!(
                    "connect failed: {}",
                    result.error.unwrap_or_else(|| "unknown error".into())
                );
            }

            let settled = async {
                loop {
                    match hub.connections().state(&id) {
                        ServerStatus::Ready | ServerStatus::Error | ServerStatus::Disconnected => {
                            return
                        }
                        _ => {}
                    }
                    if let Err(broadcast::error::RecvError::Closed) = changes.recv().await {
                        return;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(wait), settled)
                .await
                .with_context(|| format!("server '{id}' did not finish its handshake"))?;

            let config = hub.store().get(&id).context("server vanished while connecting")?;
            if config.status != ServerStatus::Ready {
                bail!(
                    "server '{id}' failed: {}",
                    config.error_message.unwrap_or_else(|| config.status.to_string())
                );
            }
            if json {
                return print_json(&config.tools);
            }
            println!("server '{id}' ready with {} tools", config.tools.len());
            for tool in config.tools {
                println!("  {:<32} {}", tool.name, tool.description);
            }
        }

        Commands::Search {
            query,
            tag,
            registry,
            top_rated,
            limit,
            offset,
        } => {
            let options = SearchOptions {
                query,
                tags: tag,
                registry,
                sort_by: if top_rated { SortBy::Rating } else { SortBy::Name },
                sort_order: if top_rated { SortOrder::Desc } else { SortOrder::Asc },
                limit,
                offset,
                ..SearchOptions::default()
            };
            let result = hub.cache().search_servers(&options);
            if json {
                return print_json(&result);
            }
            for server in &result.servers {
                println!("{:<40} {:<12} {}", server.id, server.registry, server.description);
            }
            println!(
                "{} of {} results{}",
                result.servers.len(),
                result.total,
                if result.from_cache { " (cached)" } else { "" }
            );
        }

        Commands::Install { registry_id } => {
            let config = hub
                .install_from_registry(&registry_id)
                .with_context(|| format!("failed to install '{registry_id}'"))?;
            if json {
                return print_json(&config);
            }
            println!("installed '{}' as disabled server '{}'", registry_id, config.id);
        }

        Commands::Sync { force } => {
            if hub.sync().registries().is_empty() {
                bail!("no registries configured in toolhub.yaml");
            }
            let outcomes = hub.sync().sync_all(force).await;
            if json {
                return print_json(&outcomes);
            }
            for outcome in &outcomes {
                match (&outcome.status, &outcome.error) {
                    (None, _) => println!("{:<16} fresh, skipped", outcome.registry),
                    (_, Some(error)) => println!("{:<16} error: {error}", outcome.registry),
                    _ if outcome.not_modified => {
                        println!("{:<16} unchanged since last sync", outcome.registry)
                    }
                    _ => println!(
                        "{:<16} {} fetched, {} written, {} skipped in {} ms",
                        outcome.registry,
                        outcome.fetched,
                        outcome.written,
                        outcome.skipped,
                        outcome.duration_ms
                    ),
                }
            }
        }

        Commands::Stats => {
            let stats = serde_json::json!({
                "cache": hub.cache().get_cache_stats(),
                "registries": hub.cache().list_registry_syncs(),
                "pool": hub.pool().metrics(),
                "concurrency": {
                    "status": hub.concurrency().get_status(),
                    "stats": hub.concurrency().get_stats(),
                },
            });
            print_json(&stats)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}
