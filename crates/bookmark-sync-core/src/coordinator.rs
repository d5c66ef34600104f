//! Sync coordinator: startup classification, conflict resolution and manual
//! re-sync.
//!
//! ```text
//! IDLE --start--> SYNCING --+--> IDLE      (push, pull, equal or both empty)
//!                           +--> CONFLICT  (both sides have data and differ)
//!                           +--> ERROR
//! CONFLICT --resolve_conflict--> SYNCING --> IDLE | ERROR
//! ```
//!
//! The steady-state pipelines are only activated on the way to IDLE, so
//! nothing is written automatically while a conflict is pending.

use crate::compare::trees_are_equal;
use crate::context::SyncContext;
use crate::downstream::{self, DownstreamPipeline, RemoteSnapshot};
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::merge::merge;
use crate::status::{ResolutionStrategy, SyncReport, SyncState, SyncStatus};
use crate::tree::{self, CleanNode};
use crate::upstream::{self, UpstreamPipeline};
use crate::version::{SyncSource, VersionMetadata, now_millis};
use std::cmp::Ordering;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Both sides as they were when the conflict was detected.
struct ConflictSnapshots {
    uid: String,
    local: Vec<CleanNode>,
    remote: Vec<CleanNode>,
    remote_metadata: Option<VersionMetadata>,
}

/// Local and remote state read at the beginning of a sync.
struct Sides {
    local: Vec<CleanNode>,
    remote: Vec<CleanNode>,
    remote_metadata: Option<VersionMetadata>,
}

pub struct SyncCoordinator {
    ctx: SyncContext,
    status: Mutex<SyncStatus>,
    conflict: tokio::sync::Mutex<Option<ConflictSnapshots>>,
    upstream: UpstreamPipeline,
    downstream: DownstreamPipeline,
    /// Serializes start, resolve_conflict, sync_now and stop
    operation: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            upstream: UpstreamPipeline::new(ctx.clone()),
            downstream: DownstreamPipeline::new(ctx.clone()),
            ctx,
            status: Mutex::new(SyncStatus::idle()),
            conflict: tokio::sync::Mutex::new(None),
            operation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the steady-state pipelines are active
    pub async fn is_active(&self) -> bool {
        self.upstream.is_running() && self.downstream.is_running().await
    }

    fn set_status(&self, mut status: SyncStatus) -> SyncStatus {
        {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if status.last_synced.is_none() {
                status.last_synced = current.last_synced;
            }
            if current.state != status.state {
                info!("Sync state: {} -> {}", current.state, status.state);
            }
            *current = status.clone();
        }
        self.ctx.emit(SyncEvent::StatusChanged {
            status: status.clone(),
        });
        status
    }

    fn set_synced(&self) -> SyncStatus {
        self.set_status(SyncStatus {
            last_synced: Some(now_millis()),
            ..SyncStatus::idle()
        })
    }

    fn set_failed(&self, error: &SyncError) -> SyncStatus {
        self.set_status(SyncStatus::failed(error.to_string()))
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Run the startup sync and activate the pipelines unless a conflict or an
    /// error stops it. Returns the resulting status.
    pub async fn start(&self) -> SyncStatus {
        let _operation = self.operation.lock().await;

        let Some(user) = self.ctx.session.current_user().await else {
            info!("No active session, sync stays idle");
            return self.status();
        };

        self.set_status(SyncStatus::with_state(SyncState::Syncing));
        match self.initial_sync(&user.uid).await {
            Ok(status) => status,
            Err(e) => {
                error!("Startup sync failed: {}", e);
                self.set_failed(&e)
            }
        }
    }

    async fn initial_sync(&self, uid: &str) -> Result<SyncStatus> {
        let sides = self.read_sides(uid, true).await?;
        let has_local = tree::has_significant_data(&sides.local);
        let has_remote = tree::has_significant_data(&sides.remote);

        match (has_local, has_remote) {
            (true, false) => {
                info!("Remote is empty, uploading local bookmarks");
                upstream::push_tree(&self.ctx, uid, &sides.local, SyncSource::Browser).await?;
            }
            (false, true) => {
                info!("No local bookmarks, downloading remote bookmarks");
                downstream::apply_remote_changes(&self.ctx, &sides.remote).await?;
                self.adopt_remote(sides.remote_metadata.as_ref(), &sides.remote)
                    .await?;
            }
            (true, true) if trees_are_equal(&sides.local, &sides.remote) => {
                info!("Local and remote bookmarks already match");
                self.adopt_remote(sides.remote_metadata.as_ref(), &sides.remote)
                    .await?;
            }
            (true, true) => {
                let items_local = tree::count_nodes(&sides.local);
                let items_remote = tree::count_nodes(&sides.remote);
                warn!(
                    "Local ({} items) and remote ({} items) bookmarks differ, waiting for resolution",
                    items_local, items_remote
                );
                *self.conflict.lock().await = Some(ConflictSnapshots {
                    uid: uid.to_string(),
                    local: sides.local,
                    remote: sides.remote,
                    remote_metadata: sides.remote_metadata,
                });
                return Ok(self.set_status(SyncStatus {
                    items_local: Some(items_local),
                    items_remote: Some(items_remote),
                    ..SyncStatus::with_state(SyncState::Conflict)
                }));
            }
            (false, false) => {
                debug!("No bookmarks on either side");
                self.ctx.flags.set_baseline(sides.local);
            }
        }

        self.activate(uid).await?;
        Ok(self.set_synced())
    }

    /// Read the local tree and the remote root concurrently.
    async fn read_sides(&self, uid: &str, init_mirror: bool) -> Result<Sides> {
        let paths = self.ctx.paths(uid);
        let (host_tree, remote_value) = futures::try_join!(
            async { self.ctx.host.get_tree().await.map_err(SyncError::from) },
            async { self.ctx.remote.read(paths.root()).await.map_err(SyncError::from) },
        )?;

        if init_mirror {
            self.ctx.mirror.lock().await.init_from_tree(&host_tree).await?;
        }

        let (remote, remote_metadata) = match RemoteSnapshot::parse(remote_value)? {
            Some(snapshot) => (snapshot.tree, snapshot.metadata),
            None => (Vec::new(), None),
        };
        Ok(Sides {
            local: tree::encode_tree(&host_tree),
            remote,
            remote_metadata,
        })
    }

    /// Record that the local tree now matches `remote`.
    async fn adopt_remote(
        &self,
        metadata: Option<&VersionMetadata>,
        remote: &[CleanNode],
    ) -> Result<()> {
        if let Some(metadata) = metadata {
            self.ctx.versions.update_local_version(metadata).await?;
        }
        self.ctx.mirror.lock().await.clear_tombstones().await?;
        self.ctx.flags.clear_dirty();
        self.ctx.flags.set_baseline(remote.to_vec());
        Ok(())
    }

    /// Refresh the mirror after a local rewrite the observer didn't see.
    async fn refresh_mirror(&self) -> Result<()> {
        let host_tree = self.ctx.host.get_tree().await?;
        self.ctx.mirror.lock().await.rebuild(&host_tree).await?;
        Ok(())
    }

    async fn activate(&self, uid: &str) -> Result<()> {
        if !self.upstream.is_running() {
            self.refresh_mirror().await?;
        }
        self.upstream.start();
        self.downstream.start(uid).await
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Settle a pending conflict. Only valid in `CONFLICT`.
    ///
    /// `Clear` wipes both sides; callers must have confirmed it.
    pub async fn resolve_conflict(&self, strategy: ResolutionStrategy) -> Result<SyncStatus> {
        let _operation = self.operation.lock().await;

        if self.status().state != SyncState::Conflict {
            return Err(SyncError::NotInConflict);
        }
        let Some(snapshots) = self.conflict.lock().await.take() else {
            return Err(SyncError::NotInConflict);
        };

        info!("Resolving conflict with strategy {:?}", strategy);
        self.set_status(SyncStatus::with_state(SyncState::Syncing));

        let resolved = async {
            self.apply_resolution(&snapshots, strategy).await?;
            self.activate(&snapshots.uid).await
        }
        .await;

        match resolved {
            Ok(()) => Ok(self.set_synced()),
            Err(e) => {
                error!("Conflict resolution failed: {}", e);
                self.set_failed(&e);
                Err(e)
            }
        }
    }

    async fn apply_resolution(
        &self,
        snapshots: &ConflictSnapshots,
        strategy: ResolutionStrategy,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let uid = snapshots.uid.as_str();

        match strategy {
            ResolutionStrategy::Local => {
                upstream::push_tree(ctx, uid, &snapshots.local, SyncSource::Browser).await?;
            }
            ResolutionStrategy::Remote => {
                downstream::apply_remote_changes(ctx, &snapshots.remote).await?;
                self.adopt_remote(snapshots.remote_metadata.as_ref(), &snapshots.remote)
                    .await?;
            }
            ResolutionStrategy::Merge => {
                let tombstones = ctx.mirror.lock().await.tombstones().to_vec();
                let merged = merge(&snapshots.local, &snapshots.remote, &tombstones);
                info!(
                    "Merged {} local and {} remote items into {}",
                    tree::count_nodes(&snapshots.local),
                    tree::count_nodes(&snapshots.remote),
                    tree::count_nodes(&merged)
                );
                downstream::apply_remote_changes(ctx, &merged).await?;
                upstream::push_tree(ctx, uid, &merged, SyncSource::Browser).await?;
            }
            ResolutionStrategy::Clear => {
                warn!("Clearing bookmarks on both sides");
                downstream::apply_remote_changes(ctx, &[]).await?;
                upstream::push_tree(ctx, uid, &[], SyncSource::Browser).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Steady-state sync
    // ========================================================================

    /// Run one steady-state sync, retrying with exponential backoff.
    ///
    /// Returns an empty report when signed out. After the last failed attempt
    /// the status is `ERROR` and the error is returned.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let _operation = self.operation.lock().await;

        if self.status().state == SyncState::Conflict {
            return Err(SyncError::ConflictPending);
        }
        let Some(user) = self.ctx.session.current_user().await else {
            info!("No active session, nothing to sync");
            return Ok(SyncReport::default());
        };

        self.set_status(SyncStatus::with_state(SyncState::Syncing));
        let max_attempts = self.ctx.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = async {
                let report = self.sync_once(&user.uid).await?;
                self.activate(&user.uid).await?;
                Ok::<_, SyncError>(report)
            }
            .await;

            match result {
                Ok(report) => {
                    debug!(
                        "Sync finished: pulled {}, pushed {}, conflicts {}",
                        report.pulled, report.pushed, report.conflicts
                    );
                    self.set_synced();
                    return Ok(report);
                }
                Err(e @ SyncError::DestructiveWrite { .. }) => {
                    self.set_failed(&e);
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!("Sync failed after {} attempts: {}", attempt, e);
                        self.set_failed(&e);
                        return Err(e);
                    }
                    let delay = self.ctx.config.backoff(attempt - 1);
                    warn!(
                        "Sync attempt {} failed: {}, retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn sync_once(&self, uid: &str) -> Result<SyncReport> {
        let ctx = &self.ctx;
        let sides = self.read_sides(uid, false).await?;
        let local_metadata = ctx.versions.local_version().await?;
        let tombstones = ctx.mirror.lock().await.tombstones().to_vec();
        let dirty = ctx.flags.is_dirty() || !tombstones.is_empty();

        if !dirty
            && sides
                .remote_metadata
                .as_ref()
                .is_some_and(|remote| local_metadata.same_sync_as(remote))
        {
            debug!("Already in sync at version {}", local_metadata.version);
            return Ok(SyncReport::default());
        }

        if trees_are_equal(&sides.local, &sides.remote) {
            debug!("Trees match, adopting remote version");
            self.adopt_remote(sides.remote_metadata.as_ref(), &sides.remote)
                .await?;
            return Ok(SyncReport::default());
        }

        let remote_ahead = sides
            .remote_metadata
            .as_ref()
            .is_some_and(|remote| remote.authority_cmp(&local_metadata) == Ordering::Greater);

        if remote_ahead && !dirty {
            info!("Remote is newer, pulling");
            downstream::apply_remote_changes(ctx, &sides.remote).await?;
            self.adopt_remote(sides.remote_metadata.as_ref(), &sides.remote)
                .await?;
            return Ok(SyncReport {
                pulled: tree::count_nodes(&sides.remote),
                ..SyncReport::default()
            });
        }

        if remote_ahead {
            info!("Both sides changed, merging");
            let merged = merge(&sides.local, &sides.remote, &tombstones);
            downstream::apply_remote_changes(ctx, &merged).await?;
            upstream::push_tree(ctx, uid, &merged, SyncSource::Browser).await?;
            let nodes = tree::count_nodes(&merged);
            return Ok(SyncReport {
                pulled: nodes,
                pushed: nodes,
                conflicts: 1,
            });
        }

        info!("Local is newer, pushing");
        upstream::check_destructive(&sides.remote, &sides.local)?;
        upstream::push_tree(ctx, uid, &sides.local, SyncSource::Browser).await?;
        Ok(SyncReport {
            pushed: tree::count_nodes(&sides.local),
            ..SyncReport::default()
        })
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Deactivate both pipelines (e.g. on logout). Writes in flight complete.
    pub async fn stop(&self) {
        let _operation = self.operation.lock().await;
        self.upstream.stop();
        self.downstream.stop().await;
        *self.conflict.lock().await = None;
        self.ctx.flags.clear_baseline();
        self.set_status(SyncStatus::idle());
    }
}
