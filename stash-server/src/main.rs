//! Stash - transactional write gate for a git-backed content tree
//!
//! - `serve`: run the lock watchdog and the periodic sync until Ctrl-C
//! - `apply`: run a JSON batch of operations as a single transaction
//! - `log`: show recent history
//! - `diff`, `blame`: inspect the history of one file
//!
//! Every subcommand takes the content root's interlock while it writes, so a
//! CLI `apply` and a running `serve` never change the tree at the same time.

mod batch;

use anyhow::{Context, Result};
use batch::Batch;
use clap::{Parser, Subcommand};
use stash_core::{
    ContentGate, GitHistory, HistoryBackend, Holder, Identity, Interlock, LocalContentStore,
    StashConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stash")]
#[command(author = "Stash Contributors")]
#[command(version)]
#[command(about = "Transactional write gate for a git-backed content tree", long_about = None)]
struct Cli {
    /// TOML configuration file; STASH_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the content root
    #[arg(long, global = true)]
    content_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the watchdog and sync scheduler until interrupted
    Serve,

    /// Apply a JSON batch file as one transaction
    Apply {
        /// Batch file
        batch: PathBuf,

        /// Commit message (overrides the batch file's)
        #[arg(short, long)]
        message: Option<String>,

        /// Author as "Name <email>" (overrides the batch file's)
        #[arg(long)]
        author: Option<String>,

        /// Seconds to wait for the write lock
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Show recent history entries
    Log {
        /// Restrict to one path
        path: Option<String>,

        #[arg(short = 'n', long, default_value_t = 20)]
        max_count: usize,
    },

    /// Show the diff of one file against a revision
    Diff {
        path: String,

        /// Revision to compare with (default HEAD~1)
        #[arg(long)]
        rev: Option<String>,
    },

    /// Show who last changed each line of a file
    Blame {
        path: String,

        /// Line range as START,END (1-based, inclusive)
        #[arg(short = 'L', long, value_parser = parse_line_range)]
        lines: Option<(usize, usize)>,
    },
}

fn parse_line_range(value: &str) -> std::result::Result<(usize, usize), String> {
    let (start, end) = value
        .split_once(',')
        .ok_or_else(|| format!("expected START,END, got {value}"))?;
    let start: usize = start.trim().parse().map_err(|_| format!("bad start line: {start}"))?;
    let end: usize = end.trim().parse().map_err(|_| format!("bad end line: {end}"))?;
    if start == 0 || end < start {
        return Err(format!("invalid line range {start},{end}"));
    }
    Ok((start, end))
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

struct Runtime {
    config: StashConfig,
    history: Arc<GitHistory>,
    gate: Arc<ContentGate>,
}

async fn open(cli: &Cli) -> Result<Runtime> {
    let mut config =
        StashConfig::from_env(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = &cli.content_root {
        config.content_root = root.clone();
    }

    if let Some(url) = &config.git.clone_url {
        GitHistory::clone_into(
            &config.content_root,
            url,
            &config.git.clone_branch,
            config.git.clone_token.as_deref(),
            config.sync.recursive,
        )
        .await
        .with_context(|| format!("Failed to clone {} into the content root", url))?;
    }

    let store = Arc::new(
        LocalContentStore::open(&config.content_root).with_context(|| {
            format!("Failed to open content root {}", config.content_root.display())
        })?,
    );
    let history = Arc::new(GitHistory::new(store.root()));
    history
        .validate(&config.default_author())
        .await
        .context("Content root is not a usable git repository")?;

    let interlock = Interlock::for_root(store.root());
    let gate = Arc::new(ContentGate::interlocked(
        store,
        history.clone(),
        &config,
        interlock,
    ));
    Ok(Runtime {
        config,
        history,
        gate,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match &cli.command {
        Commands::Serve => serve(&cli).await,
        Commands::Apply {
            batch,
            message,
            author,
            wait,
        } => apply(&cli, batch, message.clone(), author.clone(), *wait).await,
        Commands::Log { path, max_count } => log(&cli, path.as_deref(), *max_count).await,
        Commands::Diff { path, rev } => diff(&cli, path, rev.as_deref()).await,
        Commands::Blame { path, lines } => blame(&cli, path, *lines).await,
    }
}

async fn serve(cli: &Cli) -> Result<()> {
    let rt = open(cli).await?;
    info!("Content root: {}", rt.config.content_root.display());
    info!(
        "Transaction timeout {:?}, lock wait {:?}",
        rt.config.transaction.ttl(),
        rt.config.transaction.lock_wait()
    );

    if let Some(token) = &rt.config.sync.token {
        rt.history
            .install_credentials(token)
            .await
            .context("Failed to install git credentials")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = rt.gate.spawn_watchdog(shutdown_rx.clone());

    let sync = if rt.config.sync.enabled {
        let scheduler = rt.gate.sync_scheduler(rt.config.sync.clone());
        Some((scheduler.clone(), scheduler.spawn(shutdown_rx)))
    } else {
        info!("Sync disabled");
        None
    };

    info!("Stash ready; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    watchdog.await.context("Watchdog task failed")?;
    if let Some((scheduler, handle)) = sync {
        handle.await.context("Sync task failed")?;
        let stats = scheduler.stats();
        info!(
            "Sync: {} ticks, {} pulls, {} skipped, {} failures",
            stats.ticks, stats.pulls, stats.skipped, stats.failures
        );
    }

    let status = rt.gate.transaction_status("");
    if status.has_active_transaction {
        warn!(
            "Transaction {:?} still active at shutdown; its staged changes are discarded",
            status.transaction_id
        );
    }
    Ok(())
}

async fn apply(
    cli: &Cli,
    path: &std::path::Path,
    message: Option<String>,
    author: Option<String>,
    wait: Option<u64>,
) -> Result<()> {
    let batch = Batch::load(path)?;
    let rt = open(cli).await?;

    let session = format!("cli-{}", std::process::id());
    let mut holder = Holder::new(&session);
    if let Some(author) = author.or(batch.author) {
        holder = holder.with_author(Identity::parse(&author));
    }
    let wait = wait
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| rt.config.transaction.lock_wait());

    let id = rt
        .gate
        .begin_transaction(holder, wait)
        .await
        .context("Could not start a transaction")?;
    info!("Transaction {} started", id);

    let count = batch.operations.len();
    for op in batch.operations {
        let op = op.into();
        if let Err(e) = rt.gate.stage(&session, id, op).await {
            if let Err(abort) = rt.gate.abort_transaction(&session, id) {
                warn!("Abort of {} failed: {}", id, abort);
            }
            return Err(e).context("Batch rejected, nothing was changed");
        }
    }

    let message = message
        .or(batch.message)
        .unwrap_or_else(|| format!("Apply {} operations", count));
    let commit = rt
        .gate
        .commit_transaction(&session, id, &message)
        .await
        .context("Commit failed, nothing was changed")?;

    println!("{}", commit);
    Ok(())
}

async fn log(cli: &Cli, path: Option<&str>, max_count: usize) -> Result<()> {
    let rt = open(cli).await?;
    let entries = rt
        .history
        .log(path, max_count)
        .await
        .context("Failed to read history")?;

    for entry in entries {
        let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  {:<20}  {}",
            entry.commit_id.short(),
            when,
            entry.author,
            entry.message
        );
    }
    Ok(())
}

async fn diff(cli: &Cli, path: &str, rev: Option<&str>) -> Result<()> {
    let rt = open(cli).await?;
    let diff = rt
        .history
        .diff(path, rev)
        .await
        .with_context(|| format!("Failed to diff {}", path))?;
    print!("{}", diff);
    Ok(())
}

async fn blame(cli: &Cli, path: &str, lines: Option<(usize, usize)>) -> Result<()> {
    let rt = open(cli).await?;
    let blamed = rt
        .history
        .blame(path, lines)
        .await
        .with_context(|| format!("Failed to blame {}", path))?;

    for line in blamed {
        let when = chrono::DateTime::from_timestamp(line.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "{} ({:<16} {}) {:>4}  {}",
            line.commit_id.short(),
            line.author,
            when,
            line.line_number,
            line.content
        );
    }
    Ok(())
}
