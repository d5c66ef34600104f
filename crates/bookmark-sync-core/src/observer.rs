//! Change observer: one stream out of the host's four change channels.
//!
//! Every event updates the mirror. Events arriving while the suppress flag is
//! up stop there; the rest mark the local tree dirty and reach the handler.
//! The mirror is saved whenever the channels run empty.

use crate::bookmarks::{ChangedEvent, CreatedEvent, MovedEvent, RemovedEvent};
use crate::context::SyncContext;
use crate::events::SyncEvent;
use std::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A local bookmark mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Created(CreatedEvent),
    Removed(RemovedEvent),
    Changed(ChangedEvent),
    Moved(MovedEvent),
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "created",
            ChangeEvent::Removed(_) => "removed",
            ChangeEvent::Changed(_) => "changed",
            ChangeEvent::Moved(_) => "moved",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Created(e) => &e.id,
            ChangeEvent::Removed(e) => &e.id,
            ChangeEvent::Changed(e) => &e.id,
            ChangeEvent::Moved(e) => &e.id,
        }
    }
}

/// Keeps the observer running. Dropping it stops observation.
pub struct ObserverHandle {
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type DrainRequest = oneshot::Sender<()>;

/// Lets a caller wait for the running observers to catch up with the host.
#[derive(Default)]
pub struct Observers {
    drains: Mutex<Vec<mpsc::UnboundedSender<DrainRequest>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> mpsc::UnboundedReceiver<DrainRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.drains.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    /// Resolves once every running observer has handled all host events
    /// emitted before the call. Returns at once if none is running.
    pub async fn drained(&self) {
        let pending: Vec<oneshot::Receiver<()>> = {
            let mut drains = self.drains.lock().unwrap_or_else(|e| e.into_inner());
            drains.retain(|tx| !tx.is_closed());
            drains
                .iter()
                .filter_map(|tx| {
                    let (done, wait) = oneshot::channel();
                    tx.send(done).ok().map(|_| wait)
                })
                .collect()
        };
        // A stopped observer drops its request, which also ends the wait
        for wait in pending {
            let _ = wait.await;
        }
    }

    /// Number of observers still running
    pub fn running(&self) -> usize {
        let mut drains = self.drains.lock().unwrap_or_else(|e| e.into_inner());
        drains.retain(|tx| !tx.is_closed());
        drains.len()
    }
}

enum Step {
    Event(ChangeEvent),
    Lagged(u64),
    Drain(DrainRequest),
    Closed,
}

fn lift<T>(received: Result<T, RecvError>, wrap: fn(T) -> ChangeEvent) -> Step {
    match received {
        Ok(event) => Step::Event(wrap(event)),
        Err(RecvError::Lagged(skipped)) => Step::Lagged(skipped),
        Err(RecvError::Closed) => Step::Closed,
    }
}

/// Register `handler` as the consumer of unsuppressed local changes.
///
/// The host channels are subscribed before this returns, so no event emitted
/// afterwards is missed.
pub fn observe<F>(ctx: &SyncContext, handler: F) -> ObserverHandle
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    let mut created = ctx.host.on_created();
    let mut removed = ctx.host.on_removed();
    let mut changed = ctx.host.on_changed();
    let mut moved = ctx.host.on_moved();
    let mut drains = ctx.observers.register();
    let ctx = ctx.clone();

    let task = tokio::spawn(async move {
        loop {
            // Host events first: a drain request is only answered once all
            // four channels are empty
            let step = tokio::select! {
                biased;
                r = created.recv() => lift(r, ChangeEvent::Created),
                r = removed.recv() => lift(r, ChangeEvent::Removed),
                r = changed.recv() => lift(r, ChangeEvent::Changed),
                r = moved.recv() => lift(r, ChangeEvent::Moved),
                Some(done) = drains.recv() => Step::Drain(done),
            };

            match step {
                Step::Event(event) => handle_event(&ctx, event, &handler).await,
                Step::Lagged(skipped) => recover_from_lag(&ctx, skipped).await,
                Step::Drain(done) => {
                    flush_mirror(&ctx).await;
                    let _ = done.send(());
                    continue;
                }
                Step::Closed => {
                    debug!("Bookmark store closed its change channels");
                    break;
                }
            }

            if created.is_empty() && removed.is_empty() && changed.is_empty() && moved.is_empty() {
                flush_mirror(&ctx).await;
            }
        }
    });

    ObserverHandle { task }
}

async fn handle_event<F>(ctx: &SyncContext, event: ChangeEvent, handler: &F)
where
    F: Fn(ChangeEvent),
{
    let suppressed = ctx.flags.is_suppressed();

    {
        let mut mirror = ctx.mirror.lock().await;
        match &event {
            ChangeEvent::Created(e) => mirror.record_created(&e.node),
            ChangeEvent::Removed(e) => {
                mirror.forget(&e.node, !suppressed);
            }
            ChangeEvent::Changed(e) => mirror.apply_change(&e.id, &e.title, e.url.as_deref()),
            ChangeEvent::Moved(e) => mirror.apply_move(&e.id, &e.parent_id),
        }
    }

    if suppressed {
        debug!("Suppressed {} event for {}", event.kind(), event.id());
        return;
    }

    ctx.flags.mark_dirty();
    ctx.emit(SyncEvent::LocalChange {
        kind: event.kind().to_string(),
        id: event.id().to_string(),
    });
    handler(event);
}

/// Dropped events leave the mirror incomplete, so it is rebuilt from the host.
/// Only a lag outside a downstream apply can hide user edits.
async fn recover_from_lag(ctx: &SyncContext, skipped: u64) {
    if ctx.flags.is_suppressed() {
        debug!("Change observer lagged during a remote apply, {} event(s) dropped", skipped);
    } else {
        warn!("Change observer lagged, {} event(s) dropped", skipped);
        ctx.flags.mark_dirty();
    }

    let rebuilt = match ctx.host.get_tree().await {
        Ok(host_tree) => ctx.mirror.lock().await.rebuild(&host_tree).await,
        Err(e) => {
            warn!("Failed to read bookmarks to rebuild the mirror: {}", e);
            return;
        }
    };
    if let Err(e) = rebuilt {
        warn!("Failed to rebuild bookmark mirror: {}", e);
    }
}

async fn flush_mirror(ctx: &SyncContext) {
    let mut mirror = ctx.mirror.lock().await;
    if !mirror.has_unsaved_changes() {
        return;
    }
    if let Err(e) = mirror.flush().await {
        warn!("Failed to save bookmark mirror: {}", e);
    }
}
