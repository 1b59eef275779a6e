//! # threatfeed CLI
//!
//! The `threatfeed` binary manages data sources, runs ingestion on demand,
//! and starts the long-running scheduler with its admin HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! threatfeed --config ./config/threatfeed.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `threatfeed init` | Create the SQLite database and run schema migrations |
//! | `threatfeed sources` | Status table of every data source |
//! | `threatfeed source add` | Register a data source |
//! | `threatfeed run <KIND>` | Run one source now, in-process |
//! | `threatfeed runs <KIND>` | Run history for a source |
//! | `threatfeed serve` | Scheduler, workers and HTTP API until Ctrl-C |
//!
//! ## Examples
//!
//! ```bash
//! threatfeed init
//! threatfeed source add --kind RSS --label "CISA" \
//!     --config '{"feed_url": "https://www.cisa.gov/uscert/ncas/current-activity.xml"}'
//! threatfeed run RSS
//! threatfeed serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use threatfeed::clock::SystemClock;
use threatfeed::config::{self, Config};
use threatfeed::coordinator::RunCoordinator;
use threatfeed::db;
use threatfeed::hooks::{ChannelHook, HookSink, LogSink, WebhookSink};
use threatfeed::migrate;
use threatfeed::models::{RunTrigger, SourceKind};
use threatfeed::server;
use threatfeed::sources::{self, SourceRequest};
use threatfeed::store::{SqliteStore, Store};

/// Scheduled, idempotent ingestion of threat-intelligence feeds.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/threatfeed.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "threatfeed",
    about = "Scheduled, idempotent ingestion of CVE, OSV, GHSA, KEV and advisory feeds",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/threatfeed.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List data sources with their last status and next due time.
    Sources,

    /// Manage data sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Run the data source of KIND now and wait for it to finish.
    ///
    /// Subject to the same single-flight and cooldown gates as
    /// `POST /admin/run/{kind}`.
    Run {
        /// NVD, OSV, GHSA, CISA_KEV, RSS or MSRC.
        kind: SourceKind,
    },

    /// Show run history for the data source of KIND, newest first.
    Runs {
        kind: SourceKind,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Start the scheduler, worker pool and admin HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a data source for the configured organization.
    Add {
        #[arg(long)]
        kind: SourceKind,

        #[arg(long)]
        label: String,

        /// Per-kind settings as a JSON object, e.g. `{"feed_url": "..."}`.
        #[arg(long)]
        config: Option<String>,

        /// Minutes between scheduled runs. Defaults to `ingest.default_interval_minutes`.
        #[arg(long)]
        interval_minutes: Option<i64>,

        /// Register the source disabled.
        #[arg(long)]
        disabled: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            let store = open_store(&cfg).await?;
            sources::ensure_seeded(store.as_ref(), &cfg, Utc::now()).await?;
            sources::print_sources(store.as_ref(), &cfg).await?;
        }
        Commands::Source {
            action:
                SourceAction::Add {
                    kind,
                    label,
                    config,
                    interval_minutes,
                    disabled,
                },
        } => {
            let store = open_store(&cfg).await?;
            let config = match config {
                Some(raw) => serde_json::from_str(&raw).context("--config must be valid JSON")?,
                None => serde_json::json!({}),
            };
            let source = sources::register_source(
                store.as_ref(),
                &cfg,
                SourceRequest {
                    kind,
                    label,
                    config,
                    interval_minutes,
                    enabled: !disabled,
                },
                Utc::now(),
            )
            .await?;
            println!("Registered {} data source {} ({})", source.kind, source.label, source.id);
        }
        Commands::Run { kind } => {
            let store = open_store(&cfg).await?;
            sources::ensure_seeded(store.as_ref(), &cfg, Utc::now()).await?;

            let sink: Arc<dyn HookSink> = match &cfg.hook.webhook_url {
                Some(url) => Arc::new(WebhookSink::new(
                    threatfeed::fetch::FetchExecutor::build_client(&cfg.http)?,
                    url.clone(),
                )),
                None => Arc::new(LogSink),
            };
            let (hook, hook_task) = ChannelHook::spawn(sink, cfg.hook.queue_capacity);
            let coordinator =
                RunCoordinator::new(&cfg, store, Arc::new(hook), Arc::new(SystemClock))?;

            let run = coordinator.run_now(kind, RunTrigger::Manual).await?;
            sources::print_run(&run);

            // Let queued hook events drain before exiting.
            drop(coordinator);
            let _ = hook_task.await;
        }
        Commands::Runs { kind, limit } => {
            let store = open_store(&cfg).await?;
            let source = store
                .find_source(&cfg.ingest.org_id, kind)
                .await?
                .with_context(|| format!("no {} data source configured", kind))?;
            let runs = store.list_runs(&source.id, limit.clamp(1, 1000)).await?;
            sources::print_runs(&runs);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

/// Connect and migrate, so every command works against a fresh database.
async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}
