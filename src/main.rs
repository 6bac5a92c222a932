//! # rs-onyx CLI
//!
//! The `rs-onyx` binary syncs a RepairShopr shop into Onyx and inspects the
//! sync state.
//!
//! ## Usage
//!
//! ```bash
//! rs-onyx --config ./config/rs-onyx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rs-onyx init` | Write a commented config template |
//! | `rs-onyx test` | Check RepairShopr credentials |
//! | `rs-onyx sync` | Run a sync (full or poll, decided from the checkpoint) |
//! | `rs-onyx status` | Show checkpoint state |
//! | `rs-onyx stats` | Show client, limiter and cache figures |
//! | `rs-onyx prune` | Print the document ids that currently exist upstream |
//! | `rs-onyx reset` | Delete the checkpoint |
//!
//! ## Examples
//!
//! ```bash
//! # Force a full sync without sending anything
//! rs-onyx sync --full --dry-run
//!
//! # Poll for updates with JSON progress for a log shipper
//! rs-onyx sync --poll --progress json
//!
//! # Stop a long sync after 30 minutes; the next run resumes it
//! rs-onyx sync --timeout-secs 1800
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rs_onyx::cache::EntityCache;
use rs_onyx::checkpoint::CheckpointStore;
use rs_onyx::config::{self, Config};
use rs_onyx::fetch::Cancellation;
use rs_onyx::logging;
use rs_onyx::progress::ProgressMode;
use rs_onyx::sink::{self, DocumentSink, NullSink};
use rs_onyx::source::{RepairShoprClient, SourceApi};
use rs_onyx::status;
use rs_onyx::sync::{SyncEngine, SyncMode, SyncReport};

/// rs-onyx: mirror RepairShopr tickets, customers, assets and invoices
/// into Onyx.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, `RS_SUBDOMAIN`, `RS_API_KEY`, `ONYX_API_URL` and
/// `ONYX_API_KEY` are read from the environment.
#[derive(Parser)]
#[command(
    name = "rs-onyx",
    about = "Sync RepairShopr records into an Onyx knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rs-onyx.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write a commented configuration template.
    ///
    /// Refuses to overwrite an existing file.
    Init,

    /// Check that the RepairShopr API key works.
    Test,

    /// Sync RepairShopr records into Onyx.
    ///
    /// Without `--full` or `--poll` a full sync runs when none has
    /// completed in `sync.max_age_hours` or the last run was interrupted;
    /// otherwise only records updated since the last successful sync are
    /// fetched. Ctrl-C stops after the current page and keeps the
    /// checkpoint so the next run resumes.
    Sync {
        /// Force a full sync.
        #[arg(long, conflicts_with = "poll")]
        full: bool,

        /// Force a poll for updated records.
        #[arg(long)]
        poll: bool,

        /// Build documents but do not send them.
        #[arg(long)]
        dry_run: bool,

        /// Stop the run after this many seconds; the next run resumes it.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show the sync checkpoint.
    Status,

    /// Show API client, rate limiter and cache figures.
    Stats,

    /// Print the id of every document that should exist in Onyx.
    ///
    /// One id per line on stdout, for pruning documents whose records
    /// were deleted upstream.
    Prune,

    /// Delete the sync checkpoint. The next sync is a full one.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    if let Commands::Init = cli.command {
        return write_template(&cli.config);
    }

    let cfg = config::load_or_env(&cli.config)?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Test => run_test(&cfg).await?,
        Commands::Sync {
            full,
            poll,
            dry_run,
            timeout_secs,
            progress,
        } => {
            let mode = match (full, poll) {
                (true, _) => SyncMode::Full,
                (_, true) => SyncMode::Poll,
                _ => SyncMode::Auto,
            };
            let progress = match progress.as_deref() {
                Some(raw) => ProgressMode::parse(raw).with_context(|| {
                    format!("--progress must be off, human or json, got '{}'", raw)
                })?,
                None => ProgressMode::default_for_tty(),
            };
            run_sync(&cfg, mode, dry_run, timeout_secs, progress).await?;
        }
        Commands::Status => status::run_status(&cfg)?,
        Commands::Stats => run_stats(&cfg).await?,
        Commands::Prune => run_prune(&cfg).await?,
        Commands::Reset => {
            let store = CheckpointStore::new(&cfg.sync.state_path);
            store
                .clear()
                .with_context(|| format!("Failed to remove {}", store.path().display()))?;
            println!("Checkpoint cleared: {}", store.path().display());
        }
    }

    Ok(())
}

fn write_template(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!(
            "{} already exists; remove it first to write a fresh template",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, config::CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn client(cfg: &Config) -> Result<RepairShoprClient> {
    RepairShoprClient::new(&cfg.source).context("Failed to create RepairShopr client")
}

async fn run_test(cfg: &Config) -> Result<()> {
    let client = client(cfg)?;
    let me = client
        .whoami()
        .await
        .with_context(|| format!("Could not reach {}", client.base_url()))?;

    let who = ["user_name", "full_name", "email"]
        .iter()
        .find_map(|k| me.get(*k).and_then(|v| v.as_str()))
        .unwrap_or("unknown user");
    println!("Connected to {} as {}", client.base_url(), who);
    Ok(())
}

async fn run_sync(
    cfg: &Config,
    mode: SyncMode,
    dry_run: bool,
    timeout_secs: Option<u64>,
    progress: ProgressMode,
) -> Result<()> {
    let client = client(cfg)?;
    let limiter = client.limiter().clone();
    let sink: Arc<dyn DocumentSink> = Arc::from(sink::from_config(&cfg.sink, dry_run)?);
    eprintln!("Delivering to {}", sink.describe());

    let cancel = match timeout_secs {
        Some(secs) => Cancellation::with_timeout(Duration::from_secs(secs)),
        None => Cancellation::new(),
    };
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; stopping after the current page");
                cancel.cancel();
            }
        })
    };

    let engine = SyncEngine::new(cfg, Arc::new(client), sink)
        .with_progress(progress.reporter())
        .with_rate_limiter(limiter);
    let result = engine.run(mode, &cancel).await;
    watcher.abort();

    let report = result.context("Sync failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!();
    println!(
        "{} sync {}{}",
        report.sync_type,
        if report.completed {
            "complete"
        } else if report.interrupted {
            "interrupted"
        } else {
            "finished with incomplete kinds"
        },
        if report.resumed { " (resumed)" } else { "" }
    );
    if let Some(since) = report.since {
        println!("  Since:       {}", since.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  Documents:   {}", report.documents_processed);
    println!("  Sent:        {}", report.sent);
    println!("  Failed:      {}", report.failed);
    for kind in &report.kinds {
        let state = if !kind.enabled {
            "disabled"
        } else if kind.complete {
            "done"
        } else {
            "incomplete"
        };
        println!(
            "    {:<10} {:>6} docs  {:>4} pages  {}",
            kind.kind.to_string(),
            kind.emitted,
            kind.pages,
            state
        );
    }
    println!(
        "  Cache:       customers {}/{} ({:.1}% hits), assets {}/{} ({:.1}% hits)",
        report.customer_cache.size,
        report.customer_cache.max_size,
        report.customer_cache.hit_rate * 100.0,
        report.asset_cache.size,
        report.asset_cache.max_size,
        report.asset_cache.hit_rate * 100.0
    );
    if let Some(ref rl) = report.rate_limiter {
        println!(
            "  API:         {} requests, {} throttled, {:.1}s waiting",
            rl.requests_made, rl.requests_throttled, rl.total_wait_secs
        );
    }
    if report.error_count > 0 {
        println!("  Errors:      {}", report.error_count);
        for error in &report.errors {
            println!("    - {}", error);
        }
        if report.error_count > report.errors.len() {
            println!("    ... see `rs-onyx status`");
        }
    }
    if !report.completed {
        println!();
        println!("Run `rs-onyx sync` again to continue.");
    }
}

async fn run_stats(cfg: &Config) -> Result<()> {
    let client = client(cfg)?;
    if let Err(e) = client.whoami().await {
        eprintln!("warning: API check failed: {}", e);
    }
    let cache = EntityCache::new(
        cfg.cache.customer_max_size,
        cfg.cache.asset_max_size,
        cfg.cache.ttl_secs,
    );
    let sink = sink::from_config(&cfg.sink, false)?;

    println!("RepairShopr → Onyx: Connector Stats");
    println!("===================================");
    println!();
    for line in status::stats_lines(
        cfg,
        &client.stats(),
        &cache.customers.stats(),
        &cache.assets.stats(),
    ) {
        println!("{}", line);
    }
    println!();
    println!("  Sink:        {}", sink.describe());
    println!();
    Ok(())
}

async fn run_prune(cfg: &Config) -> Result<()> {
    let engine = SyncEngine::new(cfg, Arc::new(client(cfg)?), Arc::new(NullSink::new()));
    let ids = engine
        .prune_ids(&Cancellation::new())
        .await
        .context("Failed to list current records")?;
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}
