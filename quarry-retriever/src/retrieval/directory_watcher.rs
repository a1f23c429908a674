use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tracing::{debug, info, warn};

use super::sync_engine::{FsEvent, FsEventKind};

// Raw notifications are batched briefly here; the sync engine owns the real debounce
const NATIVE_BATCH: Duration = Duration::from_millis(100);

/// Watches one folder and forwards changes as [`FsEvent`]s.
///
/// The native watcher runs on its own thread; dropping this stops it.
pub struct DirectoryWatcher {
    root: PathBuf,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root)
            .finish()
    }
}

impl DirectoryWatcher {
    pub fn watch(root: &Path, recursive: bool, events: flume::Sender<FsEvent>) -> Result<Self> {
        let mut debouncer = new_debouncer(NATIVE_BATCH, move |res: DebounceEventResult| {
            match res {
                Ok(batch) => {
                    for ev in batch {
                        // The notification kind is unreliable across platforms, so ask the disk
                        let kind = if ev.path.exists() {
                            FsEventKind::Modified
                        } else {
                            FsEventKind::Deleted
                        };
                        if events.send(FsEvent::new(ev.path, kind)).is_err() {
                            // Sync loop is gone; nothing left to notify
                            return;
                        }
                    }
                }
                Err(e) => warn!("Filesystem watcher error: {e}"),
            }
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer.watcher().watch(root, mode)?;
        debug!("Watching {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            _debouncer: debouncer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// One watcher per indexed folder, all feeding the same sync channel.
#[derive(Debug)]
pub struct WatcherSet {
    events: flume::Sender<FsEvent>,
    watchers: Mutex<HashMap<String, DirectoryWatcher>>,
}

impl WatcherSet {
    pub fn new(events: flume::Sender<FsEvent>) -> Self {
        Self {
            events,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `folder`, replacing any watcher already on it.
    pub fn add(&self, folder: &str, recursive: bool) -> Result<()> {
        let watcher = DirectoryWatcher::watch(Path::new(folder), recursive, self.events.clone())?;
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(folder.to_string(), watcher);
        info!("Started watching {folder}");
        Ok(())
    }

    pub fn remove(&self, folder: &str) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(folder)
            .is_some()
    }

    pub fn is_watching(&self, folder: &str) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(folder)
    }

    pub fn len(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    async fn next_event_for(rx: &flume::Receiver<FsEvent>, name: &str) -> Option<FsEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv_async())
                .await
                .ok()?
                .ok()?;
            if event.path.file_name().is_some_and(|n| n == name) {
                return Some(event);
            }
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_watcher_reports_changes() -> Result<()> {
        let dir = tempdir()?;
        let (tx, rx) = flume::unbounded();
        let watchers = WatcherSet::new(tx);
        let root = dir.path().to_string_lossy().into_owned();
        watchers.add(&root, true)?;
        assert!(watchers.is_watching(&root));

        let path = dir.path().join("report.txt");
        std::fs::write(&path, "quarterly numbers")?;
        let created = next_event_for(&rx, "report.txt").await;
        assert_eq!(created.map(|e| e.kind), Some(FsEventKind::Modified));

        std::fs::remove_file(&path)?;
        let removed = next_event_for(&rx, "report.txt").await;
        assert_eq!(removed.map(|e| e.kind), Some(FsEventKind::Deleted));

        assert!(watchers.remove(&root));
        assert!(watchers.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_folder_cannot_be_watched() {
        let (tx, _rx) = flume::unbounded();
        let watchers = WatcherSet::new(tx);
        assert!(watchers.add("/definitely/not/here", true).is_err());
        assert!(watchers.is_empty());
    }
}
