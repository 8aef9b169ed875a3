//! scribe-daemon: Headless sync daemon for a directory-backed notes remote.
//!
//! Uses the same scribe-sync engine as the app clients, but runs as a native
//! binary syncing against a local directory. Mostly useful for soak-testing
//! the engine and for mirroring a notes tree onto disk.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scribe_daemon::DirRemote;
use scribe_sync::{FileStore, SyncConfig, SyncEngine, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "scribe-daemon")]
#[command(about = "Notes sync daemon")]
struct Args {
    /// Path to the directory acting as the remote store
    #[arg(short, long)]
    root: PathBuf,

    /// Cache directory (defaults to .scribe-cache under the root)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Seconds between sync runs
    #[arg(short, long, default_value_t = 300)]
    interval: u64,

    /// Run a single sync and exit
    #[arg(long)]
    once: bool,

    /// Drop the caches and resync against live remote state first
    #[arg(long)]
    resync: bool,

    /// Discard caches and local state, then rebuild from the remote
    #[arg(long)]
    rebuild: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,scribe_sync=debug"
    } else {
        "info,scribe_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting scribe-daemon");
    info!("Remote root: {}", args.root.display());

    let cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(|| args.root.join(".scribe-cache"));
    let store = Arc::new(FileStore::new(&cache_dir)?);
    let remote = DirRemote::new(args.root.clone());
    let engine = SyncEngine::new(remote, store, SyncConfig::default());

    // Log progress as it streams in.
    let _sub = engine.events().subscribe(|event| match event {
        SyncEvent::StructuralStarted => info!("Sync started"),
        SyncEvent::StructuralComplete {
            folders,
            notes_total,
        } => info!("Folder tree complete: {folders} folders, {notes_total} notes to load"),
        SyncEvent::NotesLoaded { loaded, total } => info!("Loaded {loaded}/{total} notes"),
        SyncEvent::Settled { error: None } => info!("Sync settled"),
        SyncEvent::Settled { error: Some(e) } => error!("Sync settled with error: {e}"),
    });

    if args.rebuild {
        engine.full_rebuild().await?;
    } else if args.resync {
        engine.force_resync().await?;
    } else {
        engine.sync().await?;
        engine.settled().await;
    }

    let snapshot = engine.snapshot();
    info!(
        "Workspace: {} folders, {} notes",
        snapshot.folders().len(),
        snapshot.notes().len()
    );

    // Recovery modes are one-shot, like --once.
    if args.once || args.resync || args.rebuild {
        return Ok(());
    }

    let interval = Duration::from_secs(args.interval.max(1));
    info!("Syncing every {}s (Ctrl-C to stop)", interval.as_secs());
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }

        if let Err(e) = engine.sync().await {
            error!("Sync failed: {e}");
            continue;
        }
        engine.settled().await;
        engine.cleanup_cache();
    }
}
