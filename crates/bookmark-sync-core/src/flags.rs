//! Shared state between the coordinator, the change observer and both pipelines.
//!
//! `suppress` keeps downstream rewrites from being observed as local edits.
//! The armed echo keeps the upstream pipeline's own write from being
//! applied back by the downstream subscription.

use crate::tree::CleanNode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub struct SyncFlags {
    suppress: AtomicBool,
    /// Bumped on every raise so a stale release can't lower a newer raise
    suppress_epoch: AtomicU64,
    local_dirty: AtomicBool,
    listening: AtomicBool,
    echo_armed_at: Mutex<Option<Instant>>,
    echo_ttl: Duration,
    /// Last tree known to be on both sides, for the destructive-write check
    baseline: Mutex<Option<Vec<CleanNode>>>,
    /// Serializes downstream applies
    pub(crate) apply_lock: tokio::sync::Mutex<()>,
}

impl SyncFlags {
    pub fn new(echo_ttl: Duration) -> Self {
        Self {
            suppress: AtomicBool::new(false),
            suppress_epoch: AtomicU64::new(0),
            local_dirty: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            echo_armed_at: Mutex::new(None),
            echo_ttl,
            baseline: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress.load(Ordering::SeqCst)
    }

    /// Raise the suppress flag. Returns the epoch to hand to `release_suppress`.
    pub fn raise_suppress(&self) -> u64 {
        let epoch = self.suppress_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.suppress.store(true, Ordering::SeqCst);
        epoch
    }

    /// Lower the flag unless it was raised again after `epoch`.
    pub fn release_suppress(&self, epoch: u64) -> bool {
        if self.suppress_epoch.load(Ordering::SeqCst) == epoch {
            self.suppress.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn mark_dirty(&self) {
        self.local_dirty.store(true, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.local_dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.local_dirty.load(Ordering::SeqCst)
    }

    /// Whether the downstream subscription is open
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Expect one echo of our own write. Call before writing.
    pub fn arm_echo(&self) {
        *self.echo_armed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Forget an armed echo, e.g. after the write failed.
    pub fn disarm_echo(&self) {
        *self.echo_armed_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// True once per armed echo, and only while it hasn't expired.
    pub fn consume_echo(&self) -> bool {
        let armed_at = self
            .echo_armed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        armed_at.is_some_and(|at| at.elapsed() < self.echo_ttl)
    }

    pub fn baseline(&self) -> Option<Vec<CleanNode>> {
        self.baseline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_baseline(&self, tree: Vec<CleanNode>) {
        *self.baseline.lock().unwrap_or_else(|e| e.into_inner()) = Some(tree);
    }

    pub fn clear_baseline(&self) {
        *self.baseline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
