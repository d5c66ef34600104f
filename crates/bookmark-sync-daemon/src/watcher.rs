//! File watcher with debouncing for the JSON files the daemon shares.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The parent
//! directory is watched non-recursively because editors and our own writes
//! replace files by rename, which a watch on the file itself would lose.

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Last seen mtime, to drop events that didn't change the file
type MtimeCache = Arc<Mutex<Option<SystemTime>>>;

/// Watches one file for changes.
pub struct FileWatcher {
    path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Start watching `path`. The file itself doesn't need to exist yet, but
    /// its directory does.
    pub fn new(path: PathBuf, debounce: Duration) -> Result<Self> {
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        // On macOS, /var/folders/... is /private/var/folders/..., and FSEvents needs the real path
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let path = dir.join(&file_name);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(None));
        let watched = path.clone();

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let relevant = events.iter().any(|event| event.path == watched);
                    if !relevant {
                        return;
                    }
                    if let Some(file_event) = Self::process_event(&watched, &mtime_cache) {
                        // Receiver dropped means nobody is watching anymore
                        let _ = event_tx.send(file_event);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a debounced batch into a `FileEvent`, or `None` if the file's
    /// mtime didn't move.
    fn process_event(path: &Path, mtime_cache: &MtimeCache) -> Option<FileEvent> {
        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());

        let kind = match std::fs::metadata(path) {
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if *cache == Some(mtime) {
                        return None;
                    }
                    *cache = Some(mtime);
                }
                FileEventKind::Modified
            }
            Err(_) => {
                *cache = None;
                FileEventKind::Deleted
            }
        };

        debug!("File event: {:?} - {}", kind, path.display());
        Some(FileEvent {
            path: path.to_path_buf(),
            kind,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    /// The watched file, with its directory canonicalized.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reports_writes_to_watched_file_only() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("remote.json");
        let mut watcher = FileWatcher::new(target.clone(), Duration::from_millis(50)).unwrap();

        std::fs::write(dir.path().join("other.json"), "{}").unwrap();
        std::fs::write(&target, "{}").unwrap();

        let event = timeout(Duration::from_secs(5), watcher.event_rx().recv())
            .await
            .expect("no event within 5s")
            .unwrap();
        assert_eq!(event.kind, FileEventKind::Modified);
        assert_eq!(event.path, watcher.path());
    }

    #[test]
    fn test_unchanged_mtime_is_skipped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("remote.json");
        std::fs::write(&target, "{}").unwrap();
        let cache: MtimeCache = Arc::new(Mutex::new(None));

        assert!(FileWatcher::process_event(&target, &cache).is_some());
        assert!(FileWatcher::process_event(&target, &cache).is_none());

        std::fs::remove_file(&target).unwrap();
        let deleted = FileWatcher::process_event(&target, &cache).unwrap();
        assert_eq!(deleted.kind, FileEventKind::Deleted);
    }
}
