//! TillSync CLI - operator interface to the offline sync queue.
//!
//! Inspects and drives the local mutation queue and event log of a till,
//! and runs the background sync daemon.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tillsync_common::{
    Connectivity, ConnectivityFlag, EntityPayload, EntityType, EventId, EventStatus, Operation,
    QueueId, Sale, SystemClock,
};
use tillsync_remote::ResilientClient;
use tillsync_store::SqliteStore;
use tillsync_sync::{
    ConflictInfo, ConflictResolution, ConflictStrategy, EventLog, RunOutcome, SyncEngine,
    SyncScheduler,
};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "tillsync")]
#[command(about = "TillSync - offline point-of-sale sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Treat the network as unavailable.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue, event log and breaker status.
    Status,

    /// List queued mutations.
    Queue,

    /// Queue a change to an entity.
    Enqueue {
        /// "create", "update" or "delete".
        #[arg(short, long)]
        operation: String,

        /// Entity collection.
        #[arg(short, long, default_value = "products")]
        entity: String,

        /// JSON snapshot of the entity.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Record a completed sale.
    Sale {
        /// JSON sale document.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Run one sync pass now.
    Sync {
        /// Only replay the event log.
        #[arg(long)]
        events_only: bool,

        /// Settle conflicts found in this pass: keep-local, keep-server,
        /// last-write-wins or merge.
        #[arg(short, long)]
        resolve: Option<String>,

        /// Fields to push for a merge resolution.
        #[arg(long, requires = "resolve")]
        merge_file: Option<PathBuf>,
    },

    /// List business events.
    Events {
        /// PENDING, SYNCED, FAILED or VOIDED.
        #[arg(short, long, default_value = "FAILED")]
        status: String,
    },

    /// Write off a rejected event.
    Void {
        event_id: String,
    },

    /// Give a failed queue item a fresh attempt budget.
    Retry {
        queue_id: i64,
    },

    /// Drop a queued item without sending it.
    Discard {
        queue_id: i64,
    },

    /// Resolve conflicts by "last-write-wins", or "none" to always ask.
    Prefer {
        strategy: String,
    },

    /// Delete synced events past retention.
    Purge,

    /// Sync in the background until Ctrl-C.
    Daemon,
}

/// Components wired from the configuration.
struct App {
    config: AppConfig,
    engine: Arc<SyncEngine>,
    events: Arc<EventLog>,
    client: Arc<ResilientClient>,
    connectivity: Arc<ConnectivityFlag>,
}

impl App {
    fn open(config: AppConfig, offline: bool) -> Result<Self> {
        let db_path = config.database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?,
        );
        let clock = Arc::new(SystemClock);
        let connectivity = Arc::new(ConnectivityFlag::new(!offline));
        let client = Arc::new(
            ResilientClient::from_config(&config.client_config(), clock.clone())
                .context("Failed to create API client")?,
        );
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            client.clone(),
            clock.clone(),
            connectivity.clone(),
            config.sync.clone(),
        ));
        let events = Arc::new(EventLog::new(
            store,
            client.clone(),
            clock,
            connectivity.clone(),
            config.events.clone(),
        ));
        info!("Using database {}", db_path.display());

        Ok(Self {
            config,
            engine,
            events,
            client,
            connectivity,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AppConfig::load(cli.config.as_deref())?;
    let app = App::open(config, cli.offline)?;

    match cli.command {
        Commands::Status => cmd_status(&app),

        Commands::Queue => cmd_queue(&app),

        Commands::Enqueue {
            operation,
            entity,
            file,
        } => cmd_enqueue(&app, &operation, &entity, &file),

        Commands::Sale { file } => cmd_sale(&app, &file),

        Commands::Sync {
            events_only,
            resolve,
            merge_file,
        } => cmd_sync(&app, events_only, resolve.as_deref(), merge_file.as_deref()).await,

        Commands::Events { status } => cmd_events(&app, &status),

        Commands::Void { event_id } => cmd_void(&app, &event_id),

        Commands::Retry { queue_id } => cmd_retry(&app, queue_id),

        Commands::Discard { queue_id } => cmd_discard(&app, queue_id).await,

        Commands::Prefer { strategy } => cmd_prefer(&app, &strategy),

        Commands::Purge => cmd_purge(&app),

        Commands::Daemon => cmd_daemon(app).await,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Show queue, event log and breaker status.
fn cmd_status(app: &App) -> Result<()> {
    let stats = app.engine.queue_stats()?;
    let preference = app.engine.conflict_preference()?;

    println!("Sync status:");
    println!("  Server: {}", app.config.client_config().base_url);
    println!("  Online: {}", app.connectivity.is_online());
    println!("  Circuit: {}", app.client.circuit_state());
    println!(
        "  Conflict preference: {}",
        preference.map(|s| s.to_string()).unwrap_or_else(|| "ask".to_string())
    );
    println!("  Mutations:");
    println!("    Pending: {}", stats.mutations_pending);
    println!("    Syncing: {}", stats.mutations_syncing);
    println!("    Failed:  {}", stats.mutations_failed);
    println!("  Events:");
    println!("    Pending: {}", stats.events_pending);
    println!("    Synced:  {}", stats.events_synced);
    println!("    Failed:  {}", stats.events_failed);
    println!("    Voided:  {}", stats.events_voided);

    Ok(())
}

/// List queued mutations.
fn cmd_queue(app: &App) -> Result<()> {
    let items = app.engine.mutations()?;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for item in items {
        println!(
            "  #{:<5} {:<7} {}/{} [{}] attempts={} queued={}",
            item.id,
            item.operation,
            item.entity_type(),
            item.entity_id(),
            item.status,
            item.attempts,
            item.timestamp.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(error) = item.last_error {
            println!("         last error: {}", error);
        }
    }

    Ok(())
}

/// Queue a change to an entity.
fn cmd_enqueue(app: &App, operation: &str, entity: &str, file: &Path) -> Result<()> {
    let operation: Operation = operation.to_ascii_uppercase().parse()?;
    let entity_type: EntityType = entity.parse()?;
    let payload = EntityPayload::from_value(entity_type, read_json(file)?)
        .context("Snapshot does not match the entity schema")?;

    let id = app
        .engine
        .enqueue(operation, payload)
        .context("Failed to queue change")?;
    println!("Queued {} as #{}", operation, id);

    Ok(())
}

/// Record a completed sale.
fn cmd_sale(app: &App, file: &Path) -> Result<()> {
    let sale: Sale = read_json(file)?;
    let event_id = app.events.record_sale(&sale).context("Failed to record sale")?;
    println!("Sale recorded: {}", event_id);
    Ok(())
}

/// Run one sync pass now.
async fn cmd_sync(
    app: &App,
    events_only: bool,
    resolve: Option<&str>,
    merge_file: Option<&Path>,
) -> Result<()> {
    if !events_only {
        let resolution = match resolve {
            Some(strategy) => Some(resolution_for(strategy.parse()?, merge_file)?),
            None => None,
        };

        let mut outcome = app.engine.run().await.context("Sync run failed")?;
        while let RunOutcome::Suspended { queue_id, .. } = &outcome {
            let queue_id = *queue_id;
            let Some(resolution) = resolution.clone() else {
                if let Some(conflict) = app.engine.pending_conflict().await {
                    print_conflict(&conflict)?;
                }
                println!("Re-run with --resolve to settle it.");
                return Ok(());
            };
            outcome = app
                .engine
                .resolve_conflict(queue_id, resolution)
                .await
                .with_context(|| format!("Failed to resolve conflict on #{}", queue_id))?;
        }

        match &outcome {
            RunOutcome::Skipped(reason) => println!("Mutation sync skipped: {:?}", reason),
            _ => {
                if let Some(summary) = outcome.summary() {
                    println!(
                        "Mutations: {} synced, {} resolved, {} failed, {} deferred{}",
                        summary.synced,
                        summary.conflicts_resolved,
                        summary.failed,
                        summary.deferred,
                        if summary.halted { " (halted: service degraded)" } else { "" }
                    );
                }
            }
        }
    }

    let events = app.events.sync_pending().await.context("Event sync failed")?;
    match events.skipped {
        Some(reason) => println!("Event sync skipped: {:?}", reason),
        None => println!(
            "Events: {} synced, {} rejected, {} deferred",
            events.synced, events.rejected, events.deferred
        ),
    }

    Ok(())
}

fn resolution_for(
    strategy: ConflictStrategy,
    merge_file: Option<&Path>,
) -> Result<ConflictResolution> {
    let resolution = match (strategy, merge_file) {
        (ConflictStrategy::Merge, Some(file)) => ConflictResolution::merge(read_json(file)?),
        (ConflictStrategy::Merge, None) => anyhow::bail!("A merge needs --merge-file"),
        (strategy, _) => ConflictResolution::new(strategy),
    };
    resolution.validate()?;
    Ok(resolution)
}

fn print_conflict(conflict: &ConflictInfo) -> Result<()> {
    println!(
        "Conflict on {} {} (#{}):",
        conflict.item.entity_type(),
        conflict.item.entity_id(),
        conflict.queue_id
    );
    println!("  Local:  {}", serde_json::to_string(&conflict.local_data)?);
    match &conflict.server_data {
        Some(server) => println!("  Server: {}", serde_json::to_string(server)?),
        None => println!("  Server: (deleted)"),
    }
    Ok(())
}

/// List business events.
fn cmd_events(app: &App, status: &str) -> Result<()> {
    let status: EventStatus = status.to_ascii_uppercase().parse()?;
    let events = app.events.events(status)?;
    if events.is_empty() {
        println!("No {} events.", status);
        return Ok(());
    }

    for event in events {
        println!(
            "  {} {} {}{}",
            event.event_id,
            event.event_type,
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event
                .transaction_id
                .map(|tx| format!(" tx={}", tx))
                .unwrap_or_default(),
        );
        if let Some(error) = event.last_error {
            println!("      {}", error);
        }
    }

    Ok(())
}

/// Write off a rejected event.
fn cmd_void(app: &App, event_id: &str) -> Result<()> {
    let event_id = EventId::new(event_id).context("Invalid event id")?;
    app.events
        .void(&event_id)
        .with_context(|| format!("Failed to void event {}", event_id))?;
    println!("Event voided: {}", event_id);
    Ok(())
}

/// Give a failed queue item a fresh attempt budget.
fn cmd_retry(app: &App, queue_id: i64) -> Result<()> {
    app.engine
        .retry_failed(QueueId(queue_id))
        .with_context(|| format!("Failed to retry #{}", queue_id))?;
    println!("Requeued #{}", queue_id);
    Ok(())
}

/// Drop a queued item without sending it.
async fn cmd_discard(app: &App, queue_id: i64) -> Result<()> {
    app.engine
        .discard(QueueId(queue_id))
        .await
        .with_context(|| format!("Failed to discard #{}", queue_id))?;
    println!("Discarded #{}", queue_id);
    Ok(())
}

/// Store or clear the last-write-wins preference.
fn cmd_prefer(app: &App, strategy: &str) -> Result<()> {
    let strategy = if strategy.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(strategy.parse::<ConflictStrategy>()?)
    };
    app.engine
        .set_conflict_preference(strategy)
        .context("Failed to store conflict preference")?;

    match strategy {
        Some(strategy) => println!("Conflicts will be resolved with {}", strategy),
        None => println!("Conflicts will be presented for review"),
    }
    Ok(())
}

/// Delete synced events past retention.
fn cmd_purge(app: &App) -> Result<()> {
    let purged = app.events.purge_synced()?;
    println!("Purged {} synced events", purged);
    Ok(())
}

/// Sync in the background until Ctrl-C.
async fn cmd_daemon(app: App) -> Result<()> {
    let handle = SyncScheduler::new(
        app.engine.clone(),
        Some(app.events.clone()),
        app.connectivity.clone(),
    )
    .spawn();
    handle.request_sync().await?;

    println!(
        "Syncing every {}s. Press Ctrl+C to stop.",
        app.config.sync.sync_interval_secs
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Stopping sync daemon");
    app.client.shutdown();
    handle.shutdown().await?;
    println!("Sync daemon stopped.");

    Ok(())
}
