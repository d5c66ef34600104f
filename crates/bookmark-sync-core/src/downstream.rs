//! Downstream pipeline: remote changes to the local store.
//!
//! Applying a remote tree is destructive: every anchor folder is emptied and
//! refilled from the snapshot. The suppress flag is raised for the duration and
//! lowered only after `SyncConfig::grace_period` has passed and the change
//! observer has handled every event queued by then, so the host's trailing
//! change events are not mistaken for user edits.

use crate::context::SyncContext;
use crate::error::Result;
use crate::events::SyncEvent;
use crate::remote::{SnapshotCallback, SubscriptionToken};
use crate::tree::{self, CleanNode, TreeNode};
use crate::version::VersionMetadata;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// One read of a user's remote root.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub tree: Vec<CleanNode>,
    pub metadata: Option<VersionMetadata>,
}

impl RemoteSnapshot {
    /// Parse the value at the user's root. `None` when nothing was ever written.
    pub fn parse(value: Option<Value>) -> Result<Option<Self>> {
        let Some(Value::Object(mut root)) = value else {
            return Ok(None);
        };

        let tree = tree::decode_tree(root.remove("tree"))?;
        let metadata = match root.remove("metadata").or_else(|| root.remove("syncVersion")) {
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::from_value(value)?),
        };
        Ok(Some(Self { tree, metadata }))
    }
}

/// Replace the local tree with `tree`.
///
/// Applies are serialized. Suppression is released after the grace period,
/// once the observers have caught up, whether or not the rewrite succeeded.
pub async fn apply_remote_changes(ctx: &SyncContext, tree: &[CleanNode]) -> Result<()> {
    let _apply = ctx.flags.apply_lock.lock().await;
    let epoch = ctx.flags.raise_suppress();

    let result = rewrite_local(ctx, tree).await;
    if let Err(e) = &result {
        error!("Failed to apply remote bookmarks: {}", e);
    }

    let flags = Arc::clone(&ctx.flags);
    let observers = Arc::clone(&ctx.observers);
    let grace = ctx.config.grace_period;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        // Events the host emitted during the apply may still be queued
        observers.drained().await;
        if flags.release_suppress(epoch) {
            debug!("Local change detection resumed");
        }
    });

    result
}

async fn rewrite_local(ctx: &SyncContext, tree: &[CleanNode]) -> Result<()> {
    let host_tree = ctx.host.get_tree().await?;
    let anchors: Vec<TreeNode> = host_tree
        .iter()
        .flat_map(|root| root.children())
        .cloned()
        .collect();

    for anchor in &anchors {
        for child in ctx.host.get_children(&anchor.id).await? {
            ctx.host.remove_subtree(&child.id).await?;
        }
    }

    for remote_anchor in tree {
        let target = remote_anchor
            .id
            .as_deref()
            .and_then(|id| anchors.iter().find(|a| a.id == id))
            .or_else(|| anchors.iter().find(|a| a.title == remote_anchor.title));

        match target {
            Some(anchor) => create_children(ctx, &anchor.id, remote_anchor.children()).await?,
            None => warn!(
                "No local folder matches remote folder '{}', skipping it",
                remote_anchor.title
            ),
        }
    }
    Ok(())
}

fn create_children<'a>(
    ctx: &'a SyncContext,
    parent_id: &'a str,
    nodes: &'a [CleanNode],
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        for node in nodes {
            let created = ctx
                .host
                .create_node(parent_id, &node.title, node.url.as_deref())
                .await?;
            if !node.is_link() {
                create_children(ctx, &created.id, node.children()).await?;
            }
        }
        Ok(())
    })
}

/// Handle one remote snapshot: skip echoes and already-applied versions,
/// apply everything else.
async fn handle_snapshot(ctx: &SyncContext, value: Option<Value>) -> Result<()> {
    if ctx.flags.consume_echo() {
        debug!("Ignoring remote echo of our own write");
        ctx.emit(SyncEvent::RemoteEchoIgnored);
        return Ok(());
    }

    let Some(snapshot) = RemoteSnapshot::parse(value)? else {
        debug!("Remote has no bookmarks yet");
        return Ok(());
    };

    if let Some(metadata) = &snapshot.metadata {
        if !ctx.versions.should_sync(metadata).await? {
            debug!("Remote version {} already applied", metadata.version);
            return Ok(());
        }
    }

    apply_remote_changes(ctx, &snapshot.tree).await?;

    let version = match &snapshot.metadata {
        Some(metadata) => {
            ctx.versions.update_local_version(metadata).await?;
            metadata.version
        }
        None => 0,
    };
    ctx.flags.clear_dirty();
    let nodes = tree::count_nodes(&snapshot.tree);
    ctx.flags.set_baseline(snapshot.tree);

    info!("Applied {} remote bookmarks (version {})", nodes, version);
    ctx.emit(SyncEvent::RemoteApplied { version, nodes });
    Ok(())
}

async fn run(ctx: SyncContext, mut snapshots: mpsc::UnboundedReceiver<Option<Value>>) {
    while let Some(value) = snapshots.recv().await {
        if let Err(e) = handle_snapshot(&ctx, value).await {
            error!("Downstream sync failed: {}", e);
        }
    }
    debug!("Downstream subscription closed");
}

pub struct DownstreamPipeline {
    ctx: SyncContext,
    token: Mutex<Option<SubscriptionToken>>,
}

impl DownstreamPipeline {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            token: Mutex::new(None),
        }
    }

    /// Pull once, then keep applying remote changes. No-op while running.
    ///
    /// The subscription is opened before the initial read; snapshots arriving
    /// meanwhile are queued and then filtered by version.
    pub async fn start(&self, uid: &str) -> Result<()> {
        let mut token = self.token.lock().await;
        if token.is_some() {
            return Ok(());
        }

        let paths = self.ctx.paths(uid);
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SnapshotCallback = Arc::new(move |value| {
            let _ = tx.send(value);
        });
        let subscribed = self.ctx.remote.subscribe(paths.root(), callback).await?;
        *token = Some(subscribed);
        self.ctx.flags.set_listening(true);

        match self.ctx.remote.read(paths.root()).await {
            Ok(value) => {
                if let Err(e) = handle_snapshot(&self.ctx, value).await {
                    error!("Initial pull failed: {}", e);
                }
            }
            Err(e) => error!("Initial pull failed: {}", e),
        }

        // Ends once unsubscribing drops the callback's sender
        tokio::spawn(run(self.ctx.clone(), rx));
        info!("Downstream sync started for {}", paths.root());
        Ok(())
    }

    /// Close the subscription. An apply already in flight runs to completion.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().await.take() {
            self.ctx.remote.unsubscribe(token);
            self.ctx.flags.set_listening(false);
            self.ctx.flags.disarm_echo();
            info!("Downstream sync stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.token.lock().await.is_some()
    }
}
