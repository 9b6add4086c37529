//! # Slalom Sync Daemon
//!
//! Runs the sync engine for one race against a local SQLite store.
//!
//! ```text
//! slalom run --race R1     Sync until Ctrl-C
//! slalom sync --race R1    One fetch + drain, then exit
//! slalom queue --race R1   Show records waiting for the cloud
//! slalom config show|init  Inspect or create sync.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slalom_core::{Entry, FaultEntry, QueueStore, RecordKind, RecordStore};
use slalom_db::{Database, DbConfig};
use slalom_sync::{
    AuthProvider, NoAuth, SyncConfig, SyncEngine, SyncEngineBuilder, SyncError, SyncEvent,
    SyncEventEmitter, TokenAuth,
};

#[derive(Parser)]
#[command(name = "slalom", version, about = "Offline-first race timing sync")]
struct Cli {
    /// Path to sync.toml (defaults to the platform config directory).
    #[arg(long, global = true, env = "SLALOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync a race until interrupted.
    Run {
        #[arg(long)]
        race: String,
    },
    /// Fetch once, drain the queues and exit.
    Sync {
        #[arg(long)]
        race: String,
    },
    /// Show queued and stored records of a race.
    Queue {
        #[arg(long)]
        race: String,
    },
    /// Inspect or create the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Writes a config with a fresh device id.
    Init {
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { race } => run(cli.config, &race).await,
        Command::Sync { race } => sync_once(cli.config, &race).await,
        Command::Queue { race } => show_queue(&race).await,
        Command::Config { action } => configure(cli.config, action),
    }
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=slalom_sync=trace` - Trace the engine only
/// - Default: INFO, DEBUG for slalom crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,slalom=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Logs engine events the way a UI would surface them.
struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::StatusChanged(status) => info!(%status, "Connection status"),
            SyncEvent::FetchCompleted {
                kind, merged, removed, ..
            } if *merged > 0 || *removed > 0 => {
                info!(%kind, merged, removed, "Cloud changes applied")
            }
            SyncEvent::FetchFailed { kind, message, .. } => warn!(%kind, %message, "Fetch failed"),
            SyncEvent::Queued { kind, id } => info!(%kind, %id, "Queued for retry"),
            SyncEvent::DuplicateDetected { key, device_ids, .. } => {
                warn!(%key, devices = ?device_ids, "Same event on several devices")
            }
            SyncEvent::AuthExpired => error!("Authentication expired, set a new SLALOM_API_TOKEN"),
            SyncEvent::RaceDeleted { race_id } => error!(%race_id, "Race was deleted"),
            _ => {}
        }
    }
}

/// Determines the database file path.
///
/// Set `SLALOM_DB_PATH` to override the platform data directory.
fn database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("SLALOM_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let proj_dirs = ProjectDirs::from("com", "slalom", "sync")
        .ok_or("Could not determine app data directory")?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("slalom.db"))
}

fn auth_from_env() -> Arc<dyn AuthProvider> {
    match std::env::var("SLALOM_API_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Arc::new(TokenAuth::new(token)),
        _ => {
            warn!("SLALOM_API_TOKEN not set, sending unauthenticated requests");
            Arc::new(NoAuth)
        }
    }
}

async fn open_database() -> Result<Arc<Database>, Box<dyn std::error::Error>> {
    let path = database_path()?;
    Ok(Arc::new(Database::new(DbConfig::new(path)).await?))
}

/// Points at `config init` when the configuration is the problem.
fn config_hint(err: SyncError) -> SyncError {
    if err.is_config_error() {
        error!(error = %err, "Invalid configuration, fix sync.toml or run `slalom config init`");
    }
    err
}

fn build_engine(config_path: Option<PathBuf>, db: &Arc<Database>) -> Result<SyncEngine, SyncError> {
    let config = SyncConfig::load(config_path).map_err(config_hint)?;
    SyncEngineBuilder::new(config)
        .with_store(Arc::clone(db))
        .with_auth(auth_from_env())
        .with_emitter(Arc::new(LogEmitter))
        .build()
        .map_err(config_hint)
}

async fn run(config_path: Option<PathBuf>, race: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database().await?;
    let engine = build_engine(config_path, &db)?;

    engine.start(race).await?;
    info!(race_id = %race, "Syncing, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let status = engine.status();
    engine.shutdown().await;
    db.close().await;
    info!(
        pending_entries = status.pending_entries,
        pending_faults = status.pending_faults,
        "Shutdown complete"
    );
    Ok(())
}

async fn sync_once(
    config_path: Option<PathBuf>,
    race: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database().await?;
    let engine = build_engine(config_path, &db)?;

    engine.coordinator().initialize(race).await?;
    let result = engine.coordinator().sync_now().await;
    let status = engine.status();
    engine.shutdown().await;
    db.close().await;

    result?;
    println!(
        "{race}: {} (entries cursor {}, faults cursor {}, {} entries and {} faults pending)",
        status.connection,
        status.entry_cursor,
        status.fault_cursor,
        status.pending_entries,
        status.pending_faults
    );
    Ok(())
}

async fn show_queue(race: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database().await?;

    let entries = RecordStore::<Entry>::list(&*db, race).await?;
    let faults = RecordStore::<FaultEntry>::list(&*db, race).await?;
    let entry_queue = QueueStore::<Entry>::load_queue(&*db, race).await?;
    let fault_queue = QueueStore::<FaultEntry>::load_queue(&*db, race).await?;

    println!("Race {race}");
    println!("  {}: {} stored, {} queued", RecordKind::Entry, entries.len(), entry_queue.len());
    for item in &entry_queue {
        println!(
            "    {} bib {} retries {} {}",
            item.entry.id,
            item.entry.bib,
            item.retry_count,
            item.error.as_deref().unwrap_or("")
        );
    }
    println!("  {}: {} stored, {} queued", RecordKind::Fault, faults.len(), fault_queue.len());
    for item in &fault_queue {
        println!(
            "    {} bib {} gate {} retries {} {}",
            item.entry.id,
            item.entry.bib,
            item.entry.gate_number,
            item.retry_count,
            item.error.as_deref().unwrap_or("")
        );
    }

    db.close().await;
    Ok(())
}

fn configure(
    config_path: Option<PathBuf>,
    action: ConfigAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show => {
            let config = SyncConfig::load(config_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { name } => {
            let mut config = SyncConfig::new();
            if let Some(name) = name {
                config.device.name = name;
            }
            let path = config.save(config_path)?;
            println!("Wrote {} (device {})", path.display(), config.device_id());
        }
    }
    Ok(())
}
