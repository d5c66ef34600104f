//! bookmark-sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod bookmark_file;
pub mod file_remote;
pub mod persistence;
pub mod watcher;

// Re-export key types for convenience
pub use bookmark_file::JsonBookmarkFile;
pub use file_remote::FileRemote;
pub use persistence::JsonFileStore;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
