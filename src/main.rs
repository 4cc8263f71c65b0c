//! # Rule Harness CLI (`rulectl`)
//!
//! The `rulectl` binary is the primary interface for Rule Harness. It
//! provides commands for database initialization, rule ingestion, search,
//! store statistics, and starting the HTTP control surface.
//!
//! ## Usage
//!
//! ```bash
//! rulectl --config ./config/harness.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rulectl init` | Create the SQLite database and schema |
//! | `rulectl sync <source>` | Ingest rules from a source (github, filesystem) |
//! | `rulectl search "<query>"` | Search indexed rules |
//! | `rulectl stats` | Store totals, severity breakdown, checkpoint age |
//! | `rulectl serve` | Start the HTTP control surface |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rule_harness::store::RuleStore;
use rule_harness::sync::SyncOrchestrator;
use rule_harness::{config, search, server, source, stats, sync};

/// Rule Harness CLI — ingest source-controlled detection rules into a
/// searchable store.
#[derive(Parser)]
#[command(
    name = "rulectl",
    about = "Rule Harness — a detection-rule ingestion and search service",
    version,
    long_about = "Rule Harness pulls detection rule definitions from a source-controlled \
    rule set (GitHub or a local checkout), normalizes them, and publishes them idempotently \
    into a searchable SQLite store with resumable sync checkpoints."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harness.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (rules,
    /// rules_fts, checkpoints). Idempotent — running it multiple times is
    /// safe.
    Init,

    /// Ingest rules from a source.
    ///
    /// Enumerates the source's rule files, fetches and parses them in
    /// bounded-concurrency batches, and upserts them into the store. Only
    /// one run may be active at a time.
    Sync {
        /// Source to sync from: `github` or `filesystem`.
        source: String,

        /// Label the run as a full re-sync rather than incremental.
        #[arg(long)]
        force: bool,
    },

    /// Search indexed rules by keyword.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Print store totals, severity breakdown, and checkpoint age.
    Stats,

    /// Start the HTTP control surface.
    ///
    /// Exposes `/health`, `POST /sync`, and `/sync/status` on the address
    /// configured in `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = RuleStore::connect(&cfg.db.path).await?;
            store.ensure_schema().await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sync { source, force } => {
            let rule_source = source::resolve_source(&cfg, &source)?;
            let store = RuleStore::connect(&cfg.db.path).await?;
            let orchestrator =
                SyncOrchestrator::new(store, rule_source, cfg.sync.clone());

            match orchestrator.run(force).await {
                Ok(run) => {
                    println!("sync {}", source);
                    println!("  files:   {}", run.total_files);
                    println!("  indexed: {}", run.indexed);
                    println!("  updated: {}", run.updated);
                    println!("  skipped: {}", run.skipped);
                    println!("  errors:  {}", run.errors);
                    if let Some(marker) = &run.marker {
                        println!("  marker:  {}", marker);
                    }
                    println!("ok");
                }
                Err(sync::SyncError::EmptySource) => {
                    anyhow::bail!(
                        "sync {} failed: no rule files found (misconfigured source or unreachable tree?)",
                        source
                    );
                }
                Err(e) => anyhow::bail!("sync {} failed: {}", source, e),
            }
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Stats => {
            let label = if cfg.sources.github.is_some() {
                "github"
            } else {
                "filesystem"
            };
            stats::run_stats(&cfg, label).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
