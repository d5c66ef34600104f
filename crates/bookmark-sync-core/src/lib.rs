//! bookmark-sync-core: Bidirectional bookmark sync between a host bookmark store
//! and a remote document store.
//!
//! This crate provides:
//! - The tree codec, structural comparison and the merge engine
//! - A local mirror of the host tree with deletion tombstones
//! - Upstream (debounced push) and downstream (suppressed apply) pipelines
//! - The coordinator state machine with conflict resolution and retrying sync
//! - BookmarkStore, RemoteStore, SessionProvider and KeyValueStore trait
//!   abstractions with in-memory implementations

pub mod bookmarks;
pub mod compare;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod downstream;
pub mod error;
pub mod events;
pub mod flags;
pub mod merge;
pub mod mirror;
pub mod observer;
pub mod remote;
pub mod session;
pub mod status;
pub mod store;
pub mod tree;
pub mod upstream;
pub mod version;

pub use bookmarks::{BookmarkError, BookmarkStore, InMemoryBookmarks};
pub use compare::trees_are_equal;
pub use config::SyncConfig;
pub use context::SyncContext;
pub use coordinator::SyncCoordinator;
pub use error::SyncError;
pub use events::{EventBus, Subscription, SyncEvent};
pub use merge::merge;
pub use remote::{InMemoryRemote, RemoteError, RemoteStore, SnapshotCallback, SubscriptionToken};
pub use session::{SessionProvider, StaticSession, User};
pub use status::{ResolutionStrategy, SyncReport, SyncState, SyncStatus};
pub use store::{InMemoryStore, KeyValueStore, StoreError};
pub use tree::{CleanNode, TreeNode};
pub use version::{SyncSource, VersionManager, VersionMetadata};
