//! ledgersync CLI - inspect and maintain a persisted offline change queue.
//!
//! Works directly on the state store, without contacting the remote
//! authority.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use ledgersync_common::{ClientId, Timestamp, UserId};
use ledgersync_storage::{LocalStore, StateStore};
use ledgersync_sync::{
    ChangeQueue, Clock, ConflictLedger, LogicalClock, OfflineChange, SyncConfig, SystemClock,
};

#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(about = "ledgersync - Offline change queue maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON sync configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of the file-backed state store.
    #[arg(short, long, global = true, default_value = ".ledgersync")]
    store: PathBuf,

    /// User whose queue to operate on.
    #[arg(short, long, global = true, default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queued change and conflict counts.
    Status,

    /// List queued changes.
    Queue {
        /// Include resolved changes.
        #[arg(short, long)]
        all: bool,
    },

    /// Print pending conflicts as JSON.
    Conflicts,

    /// Drop resolved changes past the retention window.
    Prune {
        /// Override the configured retention, in seconds.
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

/// Queue and conflict map of one user, as persisted.
struct Workspace {
    config: SyncConfig,
    queue: ChangeQueue,
    ledger: ConflictLedger,
}

impl Workspace {
    async fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => SyncConfig::load(path)
                .await
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };

        let store: Arc<dyn StateStore> = Arc::new(
            LocalStore::new(&cli.store)
                .with_context(|| format!("Failed to open store {}", cli.store.display()))?,
        );
        debug!("Using {} store at {}", store.name(), cli.store.display());

        let user_id = UserId::new(cli.user.as_str()).context("Invalid user id")?;
        let client_id = ClientId::new("cli").context("Invalid client id")?;
        let clock = Arc::new(LogicalClock::new(Arc::new(SystemClock), None));

        let queue = ChangeQueue::load(
            store.clone(),
            config.queue_key(&user_id),
            user_id.clone(),
            client_id,
            clock,
        )
        .await
        .context("Failed to load change queue")?;
        let ledger = ConflictLedger::load(store, config.conflicts_key(&user_id))
            .await
            .context("Failed to load conflict map")?;

        Ok(Self {
            config,
            queue,
            ledger,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = Workspace::open(&cli).await?;

    match cli.command {
        Commands::Status => cmd_status(&workspace),
        Commands::Queue { all } => cmd_queue(&workspace, all),
        Commands::Conflicts => cmd_conflicts(&workspace),
        Commands::Prune { older_than_secs } => cmd_prune(workspace, older_than_secs).await,
    }
}

fn cmd_status(workspace: &Workspace) -> Result<()> {
    println!("Queued changes:      {}", workspace.queue.unresolved_count());
    println!("Resolved (retained): {}", workspace.queue.len() - workspace.queue.unresolved_count());
    println!("Conflicted entities: {}", workspace.ledger.entity_count());
    Ok(())
}

fn cmd_queue(workspace: &Workspace, all: bool) -> Result<()> {
    let changes: Vec<&OfflineChange> = workspace
        .queue
        .all()
        .iter()
        .filter(|c| all || !c.resolved)
        .collect();

    if changes.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for change in changes {
        println!(
            "{}  {:<6}  {} {}  {:?}  {}",
            change.id,
            format!("{:?}", change.change_type).to_lowercase(),
            change.entity_type(),
            change.entity_id,
            change.state(),
            format_timestamp(change.timestamp),
        );
    }
    Ok(())
}

fn cmd_conflicts(workspace: &Workspace) -> Result<()> {
    let pending = workspace.ledger.pending();
    let json = serde_json::to_string_pretty(&pending).context("Failed to encode conflicts")?;
    println!("{}", json);
    Ok(())
}

async fn cmd_prune(mut workspace: Workspace, older_than_secs: Option<u64>) -> Result<()> {
    let retention_secs = older_than_secs.unwrap_or(workspace.config.resolved_retention_secs);
    let retention_ms = i64::try_from(retention_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let before = SystemClock.now().saturating_sub(retention_ms);

    info!("Pruning changes resolved before {}", format_timestamp(before));
    let pruned = workspace
        .queue
        .prune_resolved(before)
        .await
        .context("Failed to prune queue")?;

    println!("Pruned {} resolved changes.", pruned);
    Ok(())
}

fn format_timestamp(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
