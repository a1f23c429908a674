//! Turns filesystem events and folder scans into indexing work.
//!
//! Events arrive on a `flume` channel from the watcher (or from tests). A [`Debouncer`]
//! coalesces bursts per path; once a path has been quiet for the debounce window its
//! event is processed by a single sequential loop, so events for one path are never
//! reordered. Every settled event is re-checked against the disk rather than trusted:
//! the watcher stream is at-least-once and may be duplicated or stale.
//!
//! For each settled path:
//!
//! - gone from disk: every file at or under it is marked deleted and queued for cleanup
//! - same content hash and mtime as stored: nothing to do
//! - same content hash, new mtime: metadata refreshed, no re-index
//! - new path whose hash matches a deleted or vanished record: the record is moved,
//!   keeping its chunks and vectors
//! - anything else: recorded as pending and queued for indexing

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::indexing_pipeline::IndexingPipeline;
use super::task_queue::TaskPriority;
use crate::storage::{
    FileObservation, FileRecord, FileStatus, FolderRecord, MetadataStore, is_under,
    normalize_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// A change reported by the filesystem watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
    /// Previous location, for renames
    pub from: Option<PathBuf>,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FsEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            from: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Deleted)
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            path: to.into(),
            kind: FsEventKind::Renamed,
            from: Some(from.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period a path needs before its events are processed
    pub debounce_ms: u64,
    /// Start a filesystem watcher for each indexed folder
    pub watch: bool,
    /// Files hashed in parallel during a folder scan
    pub scan_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            watch: true,
            scan_concurrency: 8,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

#[derive(Debug)]
struct PendingEvent {
    event: FsEvent,
    last_seen: Instant,
    seq: u64,
}

/// Per-path trailing debounce.
///
/// Every event for a path restarts that path's quiet period; a path settles once no
/// event has arrived for the whole window. Only the latest event per path is kept.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, PendingEvent>,
    next_seq: u64,
    coalesced: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_seq: 0,
            coalesced: 0,
        }
    }

    pub fn push(&mut self, event: FsEvent, now: Instant) {
        // The old location of a rename settles with the new one
        if let Some(from) = event.from.clone() {
            self.insert(FsEvent::deleted(from), now);
        }
        self.insert(event, now);
    }

    fn insert(&mut self, event: FsEvent, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let path = event.path.clone();
        if self
            .pending
            .insert(
                path,
                PendingEvent {
                    event,
                    last_seen: now,
                    seq,
                },
            )
            .is_some()
        {
            self.coalesced += 1;
        }
    }

    /// Remove and return the events whose path has been quiet for the window.
    ///
    /// Within one batch every path appears once; deletions come last so a move is seen
    /// from its new location before the old one is cleaned up.
    pub fn drain_settled(&mut self, now: Instant) -> Vec<FsEvent> {
        let window = self.window;
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        self.take(settled)
    }

    /// Remove and return everything, settled or not.
    pub fn drain_all(&mut self) -> Vec<FsEvent> {
        let all: Vec<PathBuf> = self.pending.keys().cloned().collect();
        self.take(all)
    }

    fn take(&mut self, paths: Vec<PathBuf>) -> Vec<FsEvent> {
        let mut events: Vec<PendingEvent> = paths
            .into_iter()
            .filter_map(|path| self.pending.remove(&path))
            .collect();
        events.sort_by_key(|pending| (pending.event.kind == FsEventKind::Deleted, pending.seq));
        events.into_iter().map(|pending| pending.event).collect()
    }

    /// When the earliest pending path settles.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.last_seen + self.window)
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Events absorbed by a later event for the same path.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

/// What syncing one path did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Outside every indexed folder, hidden, or beyond a non-recursive folder's depth
    Ignored,
    Unchanged,
    /// Same content, new timestamp; metadata refreshed only
    Touched,
    Queued,
    /// A failed file was queued for another attempt
    Retried,
    /// An existing record followed the file to its new path
    Moved { from: String },
    /// Files marked deleted and queued for cleanup
    Deleted { files: usize },
    /// A directory appeared; its files were synced
    Scanned { files: usize },
}

/// Totals for one folder scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub folder: String,
    pub files_seen: usize,
    pub queued: usize,
    pub unchanged: usize,
    pub moved: usize,
    pub removed: usize,
    pub ignored: usize,
    pub errors: usize,
}

impl ScanReport {
    fn tally(&mut self, action: &SyncAction) {
        match action {
            SyncAction::Queued | SyncAction::Retried => self.queued += 1,
            SyncAction::Unchanged | SyncAction::Touched => self.unchanged += 1,
            SyncAction::Moved { .. } => self.moved += 1,
            SyncAction::Deleted { files } => self.removed += files,
            SyncAction::Scanned { files } => self.queued += files,
            SyncAction::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, Default)]
struct SyncStats {
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_coalesced: u64,
}

/// Serializes work per path across the event loop and concurrent scans.
#[derive(Debug, Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    fn get(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_string()).or_default())
    }

    fn release(&self, path: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and the releasing caller still hold it
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            locks.remove(path);
        }
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .map(|modified| DateTime::<Utc>::from(modified).timestamp_millis())
        .unwrap_or(0)
}

/// blake3 of the file's bytes, streamed on the blocking pool.
pub async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await?
}

/// Files under `root` that a folder with these settings covers.
fn walk_files(root: &Path, include_hidden: bool, recursive: bool) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(!include_hidden);
    if !recursive {
        builder.max_depth(Some(1));
    }
    builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_some_and(|kind| kind.is_file()) => {
                Some(entry.into_path())
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Skipping unreadable entry: {e}");
                None
            }
        })
        .collect()
}

/// Whether `path` is covered by `folder`'s hidden-file and depth settings.
fn in_folder_scope(folder: &FolderRecord, path: &str) -> bool {
    let Ok(relative) = Path::new(path).strip_prefix(&folder.path) else {
        return false;
    };
    let components: Vec<_> = relative.components().collect();
    if !folder.settings.recursive && components.len() > 1 {
        return false;
    }
    folder.settings.include_hidden
        || !components
            .iter()
            .any(|part| part.as_os_str().to_string_lossy().starts_with('.'))
}

pub struct SyncEngine {
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<IndexingPipeline>,
    config: SyncConfig,
    folders: RwLock<Vec<FolderRecord>>,
    path_locks: PathLocks,
    stats: SyncStats,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<IndexingPipeline>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            config,
            folders: RwLock::new(Vec::new()),
            path_locks: PathLocks::default(),
            stats: SyncStats::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Reload the indexed folders from the store.
    pub async fn refresh_folders(&self) -> Result<()> {
        let folders = self.store.list_folders().await?;
        *self.folders.write().unwrap_or_else(PoisonError::into_inner) = folders;
        Ok(())
    }

    /// The innermost indexed folder containing `path`.
    pub(crate) fn owning_folder(&self, path: &str) -> Option<FolderRecord> {
        self.folders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|folder| is_under(path, &folder.path))
            .max_by_key(|folder| folder.path.len())
            .cloned()
    }

    /// Consume events until the channel closes.
    pub fn spawn(self: &Arc<Self>, events: flume::Receiver<FsEvent>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(events).await })
    }

    async fn run(&self, events: flume::Receiver<FsEvent>) {
        let mut debouncer = Debouncer::new(self.config.debounce());
        loop {
            let received = match debouncer.next_deadline() {
                Some(deadline) => tokio::select! {
                    event = events.recv_async() => Some(event),
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => None,
                },
                None => Some(events.recv_async().await),
            };

            match received {
                Some(Ok(event)) => {
                    self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                    debouncer.push(event, Instant::now());
                }
                Some(Err(_)) => {
                    for event in debouncer.drain_all() {
                        self.process_event(&event).await;
                    }
                    debug!("Event channel closed, sync loop stopping");
                    break;
                }
                None => {}
            }

            for event in debouncer.drain_settled(Instant::now()) {
                self.process_event(&event).await;
            }
            self.stats
                .events_coalesced
                .store(debouncer.coalesced(), Ordering::Relaxed);
        }
    }

    async fn process_event(&self, event: &FsEvent) {
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        match self.sync_path(&event.path).await {
            Ok(action) => debug!("{:?} {} -> {action:?}", event.kind, event.path.display()),
            Err(e) => warn!("Failed to sync {}: {e:#}", event.path.display()),
        }
    }

    /// Bring the stored state of one path in line with the disk.
    pub async fn sync_path(&self, path: &Path) -> Result<SyncAction> {
        let key = normalize_path(path)?;
        let lock = self.path_locks.get(&key);
        let result = {
            let _guard = lock.lock().await;
            self.sync_path_locked(&key).await
        };
        drop(lock);
        self.path_locks.release(&key);
        result
    }

    /// Sync a file found by walking a directory. Directories found here are not
    /// descended into again.
    async fn sync_walked_file(&self, path: &Path) -> Result<SyncAction> {
        let key = normalize_path(path)?;
        let lock = self.path_locks.get(&key);
        let result = {
            let _guard = lock.lock().await;
            match tokio::fs::metadata(&key).await {
                Ok(metadata) if metadata.is_file() => self.sync_file(&key, &metadata).await,
                Ok(_) => Ok(SyncAction::Ignored),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.handle_deletion(&key).await
                }
                Err(e) => Err(e.into()),
            }
        };
        drop(lock);
        self.path_locks.release(&key);
        result
    }

    async fn sync_path_locked(&self, key: &str) -> Result<SyncAction> {
        match tokio::fs::metadata(key).await {
            Ok(metadata) if metadata.is_file() => self.sync_file(key, &metadata).await,
            Ok(metadata) if metadata.is_dir() => self.sync_directory(key).await,
            Ok(_) => Ok(SyncAction::Ignored),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.handle_deletion(key).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn sync_file(&self, key: &str, metadata: &std::fs::Metadata) -> Result<SyncAction> {
        let Some(folder) = self.owning_folder(key) else {
            return Ok(SyncAction::Ignored);
        };
        if !in_folder_scope(&folder, key) {
            return Ok(SyncAction::Ignored);
        }

        let observation = FileObservation {
            path: key.to_string(),
            size: metadata.len() as i64,
            mtime: mtime_millis(metadata),
            content_hash: hash_file(Path::new(key)).await?,
            folder_id: Some(folder.id),
        };
        let max_failures = self.pipeline.config().max_consecutive_failures;

        match self.store.get_file(key).await? {
            Some(record)
                if record.status != FileStatus::Deleted
                    && record.content_hash.as_deref() == Some(observation.content_hash.as_str()) =>
            {
                if record.mtime != observation.mtime || record.size != observation.size {
                    self.store
                        .touch_file(record.id, observation.size, observation.mtime)
                        .await?;
                    return Ok(SyncAction::Touched);
                }
                if record.status == FileStatus::Failed && !record.is_terminal_failure(max_failures)
                {
                    self.pipeline.submit_path(key, TaskPriority::Normal).await?;
                    return Ok(SyncAction::Retried);
                }
                Ok(SyncAction::Unchanged)
            }
            Some(record) if record.status != FileStatus::Deleted => {
                self.store.upsert_file(&observation).await?;
                self.pipeline.submit_path(key, TaskPriority::Normal).await?;
                Ok(SyncAction::Queued)
            }
            _ => {
                if let Some(previous) = self.find_moved(&observation).await? {
                    let from = previous.path.clone();
                    self.store.rename_file(previous.id, &observation).await?;
                    info!("Detected move {from} -> {key}");
                    self.pipeline.submit_path(key, TaskPriority::Normal).await?;
                    return Ok(SyncAction::Moved { from });
                }
                self.store.upsert_file(&observation).await?;
                self.pipeline.submit_path(key, TaskPriority::Normal).await?;
                Ok(SyncAction::Queued)
            }
        }
    }

    /// A record with the same content whose file is gone: the file was moved here.
    async fn find_moved(&self, observation: &FileObservation) -> Result<Option<FileRecord>> {
        if observation.content_hash.is_empty() {
            return Ok(None);
        }
        for candidate in self
            .store
            .find_by_content_hash(&observation.content_hash)
            .await?
        {
            if candidate.path == observation.path {
                continue;
            }
            let vanished = match candidate.status {
                FileStatus::Deleted => candidate.needs_cleanup,
                _ => !tokio::fs::try_exists(&candidate.path).await.unwrap_or(true),
            };
            if vanished {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn sync_directory(&self, key: &str) -> Result<SyncAction> {
        let Some(folder) = self.owning_folder(key) else {
            return Ok(SyncAction::Ignored);
        };
        if key != folder.path && !in_folder_scope(&folder, key) {
            return Ok(SyncAction::Ignored);
        }
        let root = PathBuf::from(key);
        let settings = folder.settings;
        let paths = tokio::task::spawn_blocking(move || {
            walk_files(&root, settings.include_hidden, settings.recursive)
        })
        .await?;

        let mut files = 0;
        for path in paths {
            match self.sync_walked_file(&path).await {
                Ok(SyncAction::Queued | SyncAction::Moved { .. }) => files += 1,
                Ok(_) => {}
                Err(e) => warn!("Failed to sync {}: {e:#}", path.display()),
            }
        }
        Ok(SyncAction::Scanned { files })
    }

    /// Mark every live file at or under `key` deleted and queue its cleanup.
    pub async fn handle_deletion(&self, key: &str) -> Result<SyncAction> {
        let mut files = 0;
        for file in self.store.files_under(key).await? {
            if file.status == FileStatus::Deleted {
                continue;
            }
            self.store.mark_deleted(file.id).await?;
            self.pipeline.schedule_cleanup(file.id, &file.path).await?;
            files += 1;
        }
        if files > 0 {
            debug!("Marked {files} files under {key} deleted");
        }
        Ok(SyncAction::Deleted { files })
    }

    /// Walk a folder, sync every file in it, and retire records whose file is gone.
    pub async fn scan_folder(&self, folder: &FolderRecord) -> Result<ScanReport> {
        let root = PathBuf::from(&folder.path);
        let settings = folder.settings;
        let paths = tokio::task::spawn_blocking(move || {
            walk_files(&root, settings.include_hidden, settings.recursive)
        })
        .await?;

        let mut report = ScanReport {
            folder: folder.path.clone(),
            files_seen: paths.len(),
            ..ScanReport::default()
        };
        let mut seen = HashSet::with_capacity(paths.len());

        let mut results = stream::iter(paths)
            .map(|path| async move {
                let key = normalize_path(&path);
                let action = self.sync_walked_file(&path).await;
                (key, action)
            })
            .buffer_unordered(self.config.scan_concurrency.max(1));
        while let Some((key, action)) = results.next().await {
            if let Ok(key) = key {
                seen.insert(key);
            }
            match action {
                Ok(action) => report.tally(&action),
                Err(e) => {
                    report.errors += 1;
                    warn!("Scan of {} hit an error: {e:#}", folder.path);
                }
            }
        }
        drop(results);

        for file in self.store.files_under(&folder.path).await? {
            if file.status == FileStatus::Deleted
                || file.folder_id != Some(folder.id)
                || seen.contains(&file.path)
            {
                continue;
            }
            self.store.mark_deleted(file.id).await?;
            self.pipeline.schedule_cleanup(file.id, &file.path).await?;
            report.removed += 1;
        }

        info!(
            "Scanned {}: {} files, {} queued, {} unchanged, {} moved, {} removed",
            report.folder,
            report.files_seen,
            report.queued,
            report.unchanged,
            report.moved,
            report.removed
        );
        Ok(report)
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_processed: self.stats.events_processed.load(Ordering::Relaxed),
            events_coalesced: self.stats.events_coalesced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::chunking_strategy::{ChunkingConfig, ChunkingStrategy};
    use crate::retrieval::file_reader::MockFileReader;
    use crate::retrieval::indexing_pipeline::PipelineConfig;
    use crate::storage::sqlite_store::SqliteStore;
    use crate::storage::vector_store::SqliteVectorStore;
    use crate::storage::{FolderSettings, MetadataStore};
    use quarry_embed::{EmbeddingGateway, GatewayConfig, MockEmbeddingBackend};
    use tempfile::tempdir;

    #[test]
    fn test_burst_settles_once() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut debouncer = Debouncer::new(window);

        for i in 0..5 {
            debouncer.push(
                FsEvent::modified("/data/a.txt"),
                start + Duration::from_millis(i * 10),
            );
        }
        assert_eq!(debouncer.len(), 1);
        assert_eq!(debouncer.coalesced(), 4);

        // The window restarts with every event
        assert!(debouncer.drain_settled(start + Duration::from_millis(120)).is_empty());
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(140))
        );

        let settled = debouncer.drain_settled(start + Duration::from_millis(140));
        assert_eq!(settled, vec![FsEvent::modified("/data/a.txt")]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_deletions_settle_after_other_events() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(10));

        debouncer.push(FsEvent::renamed("/data/old.txt", "/data/new.txt"), start);
        debouncer.push(FsEvent::modified("/data/other.txt"), start);

        let settled = debouncer.drain_settled(start + Duration::from_millis(10));
        let paths: Vec<_> = settled.iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/data/new.txt"),
                PathBuf::from("/data/other.txt"),
                PathBuf::from("/data/old.txt"),
            ]
        );
        assert_eq!(settled[2].kind, FsEventKind::Deleted);
    }

    #[test]
    fn test_folder_scope_rules() {
        let folder = FolderRecord {
            id: 1,
            path: "/data".to_string(),
            settings: FolderSettings::default(),
            created_at: Utc::now(),
        };
        assert!(in_folder_scope(&folder, "/data/notes/a.md"));
        assert!(!in_folder_scope(&folder, "/data/.git/config"));
        assert!(!in_folder_scope(&folder, "/elsewhere/a.md"));

        let flat = FolderRecord {
            settings: FolderSettings {
                recursive: false,
                include_hidden: true,
                index_content: true,
            },
            ..folder
        };
        assert!(in_folder_scope(&flat, "/data/.env"));
        assert!(!in_folder_scope(&flat, "/data/notes/a.md"));
    }

    struct Harness {
        store: Arc<SqliteStore>,
        pipeline: Arc<IndexingPipeline>,
        sync: Arc<SyncEngine>,
    }

    async fn harness() -> Harness {
        let backend = Arc::new(MockEmbeddingBackend::new(32));
        let gateway = Arc::new(EmbeddingGateway::new(backend, GatewayConfig::default()).unwrap());
        let store = Arc::new(SqliteStore::open_memory().await.unwrap());
        let vectors = Arc::new(
            SqliteVectorStore::open_memory(gateway.model())
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(
            IndexingPipeline::new(
                store.clone(),
                vectors,
                gateway,
                Arc::new(MockFileReader::new()),
                ChunkingStrategy::new(ChunkingConfig::default()).unwrap(),
                PipelineConfig::default(),
            )
            .unwrap(),
        );
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            pipeline.clone(),
            SyncConfig::default().with_debounce(Duration::from_millis(20)),
        ));
        Harness {
            store,
            pipeline,
            sync,
        }
    }

    async fn register(h: &Harness, dir: &Path) -> FolderRecord {
        let key = normalize_path(dir).unwrap();
        let folder = h
            .store
            .upsert_folder(&key, FolderSettings::default())
            .await
            .unwrap();
        h.sync.refresh_folders().await.unwrap();
        folder
    }

    #[tokio::test]
    async fn test_scan_queues_new_files_and_skips_hidden() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("a.txt"), "alpha")?;
        std::fs::create_dir(dir.path().join("sub"))?;
        std::fs::write(dir.path().join("sub/b.md"), "bravo")?;
        std::fs::create_dir(dir.path().join(".hidden"))?;
        std::fs::write(dir.path().join(".hidden/c.txt"), "charlie")?;

        let h = harness().await;
        let folder = register(&h, dir.path()).await;
        let report = h.sync.scan_folder(&folder).await?;

        assert_eq!(report.files_seen, 2);
        assert_eq!(report.queued, 2);
        assert_eq!(h.pipeline.queued().await, 2);
        assert_eq!(h.store.count_by_status(Some(&folder.path)).await?.pending, 2);

        // A second scan finds nothing new
        let again = h.sync.scan_folder(&folder).await?;
        assert_eq!(again.queued, 0);
        assert_eq!(again.unchanged, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_touch_without_content_change_is_not_reindexed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha")?;

        let h = harness().await;
        register(&h, dir.path()).await;
        assert_eq!(h.sync.sync_path(&path).await?, SyncAction::Queued);

        let file = h.store.get_file(&normalize_path(&path)?).await?.unwrap();
        // Pretend the stored mtime is older than the file's
        h.store.touch_file(file.id, file.size, file.mtime - 5_000).await?;
        assert_eq!(h.sync.sync_path(&path).await?, SyncAction::Touched);
        assert_eq!(h.sync.sync_path(&path).await?, SyncAction::Unchanged);

        std::fs::write(&path, "alpha, edited")?;
        assert_eq!(h.sync.sync_path(&path).await?, SyncAction::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn test_deletion_marks_files_and_queues_cleanup() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub)?;
        std::fs::write(sub.join("a.txt"), "alpha")?;
        std::fs::write(sub.join("b.txt"), "bravo")?;

        let h = harness().await;
        let folder = register(&h, dir.path()).await;
        h.sync.scan_folder(&folder).await?;

        std::fs::remove_dir_all(&sub)?;
        assert_eq!(
            h.sync.sync_path(&sub).await?,
            SyncAction::Deleted { files: 2 }
        );
        let counts = h.store.count_by_status(Some(&folder.path)).await?;
        assert_eq!(counts.deleted, 2);
        assert_eq!(h.store.files_pending_cleanup(None).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_move_keeps_the_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let old = dir.path().join("draft.txt");
        std::fs::write(&old, "the final budget")?;

        let h = harness().await;
        register(&h, dir.path()).await;
        h.sync.sync_path(&old).await?;
        let before = h.store.get_file(&normalize_path(&old)?).await?.unwrap();

        let new = dir.path().join("final.txt");
        std::fs::rename(&old, &new)?;
        let action = h.sync.sync_path(&new).await?;
        assert_eq!(
            action,
            SyncAction::Moved {
                from: normalize_path(&old)?
            }
        );

        let after = h.store.get_file(&normalize_path(&new)?).await?.unwrap();
        assert_eq!(after.id, before.id);
        assert!(h.store.get_file(&normalize_path(&old)?).await?.is_none());
        assert_eq!(h.sync.sync_path(&old).await?, SyncAction::Deleted { files: 0 });
        Ok(())
    }

    #[tokio::test]
    async fn test_event_loop_coalesces_bursts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha")?;

        let h = harness().await;
        register(&h, dir.path()).await;
        let (tx, rx) = flume::unbounded();
        let handle = h.sync.spawn(rx);

        for _ in 0..5 {
            tx.send_async(FsEvent::modified(&path)).await?;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = h.sync.stats();
        assert_eq!(stats.events_received, 5);
        assert_eq!(stats.events_processed, 1);
        assert_eq!(h.pipeline.queued().await, 1);

        drop(tx);
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_paths_outside_folders_are_ignored() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha")?;

        let h = harness().await;
        assert_eq!(h.sync.sync_path(&path).await?, SyncAction::Ignored);
        assert!(h.store.get_file(&normalize_path(&path)?).await?.is_none());
        Ok(())
    }
}
