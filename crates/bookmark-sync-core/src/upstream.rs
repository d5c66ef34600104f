//! Upstream pipeline: local changes to the remote store.
//!
//! Observed changes are debounced; once the local tree has been quiet for
//! `SyncConfig::debounce`, the whole tree is read, encoded and written together
//! with fresh version metadata in one atomic update. A failed write is logged
//! and left for the next firing.

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::observer::{self, ObserverHandle};
use crate::tree::{self, CleanNode};
use crate::version::{SyncSource, VersionMetadata};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reject a write that would turn a non-trivial tree into an empty one.
pub fn check_destructive(before: &[CleanNode], after: &[CleanNode]) -> Result<()> {
    if tree::is_destructive(before, after) {
        let before = tree::content_count(before);
        warn!("Blocked write that would delete all {} bookmarks", before);
        return Err(SyncError::DestructiveWrite { before });
    }
    Ok(())
}

/// Write `tree` and new metadata to the remote store as one atomic update.
///
/// On success the local version cache, dirty flag, tombstones and baseline all
/// reflect the pushed tree.
pub async fn push_tree(
    ctx: &SyncContext,
    uid: &str,
    tree: &[CleanNode],
    source: SyncSource,
) -> Result<VersionMetadata> {
    let paths = ctx.paths(uid);
    let metadata = ctx
        .versions
        .create_metadata(source, Some(tree::count_items(tree)))
        .await?;

    let mut updates = BTreeMap::new();
    updates.insert(paths.tree(), tree::to_value(tree)?);
    updates.insert(paths.metadata(), serde_json::to_value(&metadata)?);

    let expect_echo = ctx.flags.is_listening();
    if expect_echo {
        ctx.flags.arm_echo();
    }
    ctx.flags.clear_dirty();

    if let Err(e) = ctx.remote.atomic_update(updates).await {
        if expect_echo {
            ctx.flags.disarm_echo();
        }
        ctx.flags.mark_dirty();
        return Err(e.into());
    }

    ctx.versions.update_local_version(&metadata).await?;
    ctx.mirror.lock().await.clear_tombstones().await?;
    ctx.flags.set_baseline(tree.to_vec());

    let nodes = tree::count_nodes(tree);
    info!("Pushed {} bookmarks (version {})", nodes, metadata.version);
    ctx.emit(SyncEvent::Pushed {
        version: metadata.version,
        nodes,
    });
    Ok(metadata)
}

/// Read the local tree and push it, unless signed out or destructive.
async fn flush(ctx: &SyncContext) -> Result<()> {
    let Some(user) = ctx.session.current_user().await else {
        info!("No active session, skipping upstream sync");
        return Ok(());
    };

    let host_tree = ctx.host.get_tree().await?;
    let tree = tree::encode_tree(&host_tree);
    if let Some(baseline) = ctx.flags.baseline() {
        check_destructive(&baseline, &tree)?;
    }

    push_tree(ctx, &user.uid, &tree, SyncSource::Browser).await?;
    Ok(())
}

async fn run(ctx: SyncContext, mut changes: mpsc::UnboundedReceiver<()>) {
    while changes.recv().await.is_some() {
        // Wait until no change has been seen for a full debounce window
        loop {
            tokio::select! {
                more = changes.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(ctx.config.debounce) => break,
            }
        }

        debug!("Local changes settled, syncing upstream");
        if let Err(e) = flush(&ctx).await {
            error!("Upstream sync failed: {}", e);
        }
    }
}

pub struct UpstreamPipeline {
    ctx: SyncContext,
    /// The debounce task ends on its own once the observer is gone
    observer: Mutex<Option<ObserverHandle>>,
}

impl UpstreamPipeline {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            observer: Mutex::new(None),
        }
    }

    /// Start observing and pushing. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut running = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let observer = observer::observe(&self.ctx, move |_event| {
            let _ = tx.send(());
        });
        tokio::spawn(run(self.ctx.clone(), rx));

        info!("Upstream sync started");
        *running = Some(observer);
    }

    /// Stop the pipeline. A write already in flight is allowed to finish.
    pub fn stop(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(observer) = observer {
            // Dropping the sender ends the loop after any in-flight flush
            observer.stop();
            info!("Upstream sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl Drop for UpstreamPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::{BookmarkStore, InMemoryBookmarks};
    use crate::config::SyncConfig;
    use crate::remote::InMemoryRemote;
    use crate::session::{StaticSession, User};
    use crate::store::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        ctx: SyncContext,
        host: Arc<InMemoryBookmarks>,
        remote: Arc<InMemoryRemote>,
        session: Arc<StaticSession>,
    }

    async fn fixture() -> Fixture {
        let host = Arc::new(InMemoryBookmarks::new());
        let remote = Arc::new(InMemoryRemote::new());
        let session = Arc::new(StaticSession::signed_in(User::new("u1")));
        let ctx = SyncContext::new(
            host.clone(),
            remote.clone(),
            session.clone(),
            Arc::new(InMemoryStore::new()),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        Fixture {
            ctx,
            host,
            remote,
            session,
        }
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_bursts() {
        let f = fixture().await;
        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();

        f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        sleep_ms(500).await;
        f.host.create_node("1", "B", Some("b.com")).await.unwrap();
        sleep_ms(900).await;
        assert_eq!(f.remote.write_count(), 0);

        sleep_ms(200).await;
        assert_eq!(f.remote.write_count(), 1);

        let tree = tree::decode_tree(f.remote.get("bookmarks/u1/tree")).unwrap();
        assert_eq!(tree[0].children().len(), 2);
        let metadata = f.remote.get("bookmarks/u1/metadata").unwrap();
        assert_eq!(metadata["source"], "browser");
        assert_eq!(metadata["itemCount"]["links"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let f = fixture().await;
        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();
        pipeline.start();

        f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        sleep_ms(1500).await;

        assert_eq!(f.remote.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_session_skips_push() {
        let f = fixture().await;
        f.session.logout();
        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();

        f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        sleep_ms(1500).await;

        assert_eq!(f.remote.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_retries_on_next_change() {
        let f = fixture().await;
        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();

        f.remote.fail_next_writes(1);
        f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        sleep_ms(1500).await;
        assert_eq!(f.remote.write_count(), 0);
        assert!(f.ctx.flags.is_dirty());

        f.host.create_node("1", "B", Some("b.com")).await.unwrap();
        sleep_ms(1500).await;
        assert_eq!(f.remote.write_count(), 1);
        assert!(!f.ctx.flags.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destructive_flush_is_blocked() {
        let f = fixture().await;
        let a = f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        let b = f.host.create_node("1", "B", Some("b.com")).await.unwrap();
        let full = tree::encode_tree(&f.host.get_tree().await.unwrap());
        f.ctx.flags.set_baseline(full);

        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();
        f.host.remove_subtree(&a.id).await.unwrap();
        f.host.remove_subtree(&b.id).await.unwrap();
        sleep_ms(1500).await;

        assert_eq!(f.remote.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_observation() {
        let f = fixture().await;
        let pipeline = UpstreamPipeline::new(f.ctx.clone());
        pipeline.start();
        pipeline.stop();
        assert!(!pipeline.is_running());

        f.host.create_node("1", "A", Some("a.com")).await.unwrap();
        sleep_ms(1500).await;

        assert_eq!(f.remote.write_count(), 0);
    }

    #[test]
    fn test_check_destructive() {
        let full = vec![CleanNode::anchor(
            "1",
            "Bar",
            vec![CleanNode::link("A", "a.com"), CleanNode::link("B", "b.com")],
        )];
        let empty = vec![CleanNode::anchor("1", "Bar", vec![])];

        assert!(matches!(
            check_destructive(&full, &empty),
            Err(SyncError::DestructiveWrite { before: 2 })
        ));
        assert!(check_destructive(&empty, &full).is_ok());
    }
}
