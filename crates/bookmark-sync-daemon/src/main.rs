//! bookmark-sync-daemon: Headless bookmark sync.
//!
//! Uses the same bookmark-sync-core as the browser extension, but keeps the
//! host bookmarks in a JSON file and uses a JSON document file (for example in
//! a folder shared between machines) as the remote store.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bookmark_sync_daemon::{FileRemote, JsonBookmarkFile, JsonFileStore};

use bookmark_sync_core::{
    ResolutionStrategy, StaticSession, SyncConfig, SyncContext, SyncCoordinator, SyncError,
    SyncEvent, SyncState, User,
};

#[derive(Parser, Debug)]
#[command(name = "bookmark-sync-daemon")]
#[command(about = "Bidirectional bookmark sync daemon")]
struct Args {
    /// JSON file holding the local bookmark tree (created if missing)
    #[arg(short, long)]
    bookmarks: PathBuf,

    /// JSON document shared with other devices (created if missing)
    #[arg(short, long)]
    remote: PathBuf,

    /// File for the mirror, tombstones and version ledger
    /// [default: sync-state.json next to the bookmarks file]
    #[arg(long)]
    state: Option<PathBuf>,

    /// User id the remote tree is stored under
    #[arg(short, long)]
    uid: String,

    /// Quiet period before local changes are pushed
    #[arg(long, default_value_t = 1000)]
    debounce_ms: u64,

    /// How long local events are ignored after applying a remote tree
    #[arg(long, default_value_t = 500)]
    grace_ms: u64,

    /// Seconds between full reconciliations (0 disables them)
    #[arg(long, default_value_t = 300)]
    interval_secs: u64,

    /// How to settle a startup conflict: merge, local, remote or clear
    #[arg(long)]
    resolve: Option<ResolutionStrategy>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            grace_period: Duration::from_millis(self.grace_ms),
            ..SyncConfig::default()
        }
    }

    fn state_path(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| self.bookmarks.with_file_name("sync-state.json"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,bookmark_sync=debug"
    } else {
        "info,bookmark_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting bookmark-sync-daemon");
    info!("Bookmarks: {:?}", args.bookmarks);
    info!("Remote: {:?}", args.remote);

    let config = args.config();
    let watch_debounce = config.debounce / 4;

    let host = Arc::new(
        JsonBookmarkFile::open(&args.bookmarks)
            .await
            .with_context(|| format!("opening {}", args.bookmarks.display()))?,
    );
    let remote = Arc::new(
        FileRemote::open(&args.remote)
            .await
            .with_context(|| format!("opening {}", args.remote.display()))?,
    );
    let state_path = args.state_path();
    let store = Arc::new(
        JsonFileStore::open(&state_path)
            .await
            .with_context(|| format!("opening {}", state_path.display()))?,
    );
    let session = Arc::new(StaticSession::signed_in(User::new(args.uid.clone())));

    host.start_watching(watch_debounce)?;
    remote.start_watching(watch_debounce)?;

    let ctx = SyncContext::new(host, remote, session, store, config).await?;
    let _events = ctx.events.subscribe(|event| match &event {
        SyncEvent::Pushed { version, nodes } => {
            info!("Pushed {} node(s) as version {}", nodes, version);
        }
        SyncEvent::RemoteApplied { version, nodes } => {
            info!("Applied remote version {} ({} node(s))", version, nodes);
        }
        other => debug!("Sync event: {:?}", other),
    });
    let coordinator = SyncCoordinator::new(ctx);

    let status = coordinator.start().await;
    if status.state == SyncState::Conflict {
        let Some(strategy) = args.resolve else {
            coordinator.stop().await;
            bail!(
                "local ({} items) and remote ({} items) bookmarks both have data; \
                 restart with --resolve merge|local|remote|clear",
                status.items_local.unwrap_or_default(),
                status.items_remote.unwrap_or_default()
            );
        };
        info!("Resolving conflict with {:?}", strategy);
        coordinator.resolve_conflict(strategy).await?;
    } else if status.state == SyncState::Error {
        warn!(
            "Startup sync failed: {}",
            status.error.as_deref().unwrap_or("unknown error")
        );
    }

    let periodic = args.interval_secs > 0;
    let period = Duration::from_secs(args.interval_secs.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Periodic full reconciliation
            _ = ticker.tick(), if periodic => {
                match coordinator.sync_now().await {
                    Ok(report) => {
                        debug!(
                            "Periodic sync: pulled {}, pushed {}, merged {}",
                            report.pulled, report.pushed, report.conflicts
                        );
                    }
                    Err(SyncError::ConflictPending) => {
                        warn!("Conflict pending, restart with --resolve to settle it");
                    }
                    Err(e) => {
                        error!("Periodic sync failed: {}", e);
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    coordinator.stop().await;
    Ok(())
}
