//! The query-side API: one explicitly constructed context owning the stores, the
//! embedding gateway, the indexing pipeline, the sync engine and the watchers.
//!
//! Lifecycle is explicit: [`Engine::open`] recovers interrupted work and resumes every
//! registered folder, [`Engine::close`] stops workers and closes the stores.

use anyhow::Result;
use chrono::Utc;
use quarry_embed::{BreakerState, EmbeddingBackend, EmbeddingGateway, HttpEmbeddingBackend};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use crate::config::EngineConfig;
use crate::error::IndexError;
use crate::retrieval::chunking_strategy::ChunkingStrategy;
use crate::retrieval::directory_watcher::WatcherSet;
use crate::retrieval::file_reader::{FileReader, LocalFileReader};
use crate::retrieval::indexing_pipeline::{CleanupResult, IndexingPipeline};
use crate::retrieval::search::{SearchQuery, SearchResponse, SearchService};
use crate::retrieval::sync_engine::{FsEvent, ScanReport, SyncEngine};
use crate::retrieval::task_queue::TaskPriority;
use crate::status::{
    ConsistencyIssue, ConsistencyReport, EngineHealth, FileFailure, FolderInfo, HealthStatus,
    IndexingProgress, RemoveFolderReport, percent_done,
};
use crate::storage::sqlite_store::SqliteStore;
use crate::storage::vector_store::SqliteVectorStore;
use crate::storage::{
    Collection, FileStatus, FolderRecord, FolderSettings, MetadataStore, SearchHistoryEntry,
    VectorIndex, is_under, normalize_path,
};

pub struct Engine {
    config: EngineConfig,
    store: Arc<SqliteStore>,
    vectors: Arc<SqliteVectorStore>,
    gateway: Arc<EmbeddingGateway>,
    pipeline: Arc<IndexingPipeline>,
    sync: Arc<SyncEngine>,
    search: SearchService,
    events: flume::Sender<FsEvent>,
    watchers: Option<WatcherSet>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    rebuilt: Vec<Collection>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.storage.data_dir)
            .field("model", &self.gateway.model().model_id())
            .finish()
    }
}

impl Engine {
    /// Open with the HTTP embedding backend and the local text reader from `config`.
    pub async fn open_with_defaults(config: EngineConfig) -> Result<Self> {
        let backend = Arc::new(HttpEmbeddingBackend::new(config.backend.clone())?);
        let reader = Arc::new(LocalFileReader::new(config.reader.max_file_size));
        Self::open(config, backend, reader).await
    }

    pub async fn open(
        config: EngineConfig,
        backend: Arc<dyn EmbeddingBackend>,
        reader: Arc<dyn FileReader>,
    ) -> Result<Self> {
        config.validate()?;
        let gateway = Arc::new(EmbeddingGateway::new(backend, config.embedding.clone())?);

        let (store, vectors) = if config.storage.in_memory {
            (
                SqliteStore::open_memory().await?,
                SqliteVectorStore::open_memory(gateway.model()).await?,
            )
        } else {
            tokio::fs::create_dir_all(&config.storage.data_dir).await?;
            (
                SqliteStore::open(&config.storage.metadata_path()).await?,
                SqliteVectorStore::open(&config.storage.vector_path(), gateway.model()).await?,
            )
        };
        let store = Arc::new(store);
        let vectors = Arc::new(vectors);

        let rebuilt = vectors.invalidated().to_vec();
        if !rebuilt.is_empty() {
            let reset = store.reset_for_reembed(None).await?;
            info!(
                "Embedding model changed to {}; {reset} files queued for re-embedding",
                gateway.model().model_id()
            );
        }

        let pipeline = Arc::new(IndexingPipeline::new(
            store.clone(),
            vectors.clone(),
            gateway.clone(),
            reader,
            ChunkingStrategy::new(config.chunking.clone())?,
            config.pipeline.clone(),
        )?);
        pipeline.recover_interrupted().await?;
        pipeline.start();

        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            pipeline.clone(),
            config.sync.clone(),
        ));
        sync.refresh_folders().await?;
        let (events, receiver) = flume::unbounded();
        let sync_task = sync.spawn(receiver);
        let watchers = config.sync.watch.then(|| WatcherSet::new(events.clone()));

        let search = SearchService::new(
            store.clone(),
            store.clone(),
            vectors.clone(),
            gateway.clone(),
            config.search.clone(),
        )?;

        let engine = Self {
            config,
            store,
            vectors,
            gateway,
            pipeline,
            sync,
            search,
            events,
            watchers,
            sync_task: Mutex::new(Some(sync_task)),
            rebuilt,
        };
        engine.resume().await?;
        Ok(engine)
    }

    /// Catch up with changes made while the engine was not running.
    async fn resume(&self) -> Result<()> {
        for folder in self.store.list_folders().await? {
            if let Err(e) = self.sync.scan_folder(&folder).await {
                warn!("Resuming {} failed: {e:#}", folder.path);
            }
            self.watch(&folder);
        }
        let requeued = self.requeue_pending(None, TaskPriority::Normal).await?;
        let cleanups = self.retry_cleanup().await?;
        if requeued + cleanups > 0 {
            info!("Resumed {requeued} pending files and {cleanups} cleanups");
        }
        Ok(())
    }

    fn watch(&self, folder: &FolderRecord) {
        if let Some(watchers) = &self.watchers {
            if let Err(e) = watchers.add(&folder.path, folder.settings.recursive) {
                warn!("Cannot watch {}, changes will only be seen on rescan: {e:#}", folder.path);
            }
        }
    }

    async fn requeue_pending(&self, scope: Option<&str>, priority: TaskPriority) -> Result<usize> {
        let pending = self
            .store
            .list_files_by_status(FileStatus::Pending, scope)
            .await?;
        for file in &pending {
            self.pipeline.submit_path(&file.path, priority).await?;
        }
        Ok(pending.len())
    }

    async fn folder_key(&self, path: &Path) -> Result<(String, FolderRecord)> {
        let key = normalize_path(path)?;
        match self.store.get_folder(&key).await? {
            Some(folder) => Ok((key, folder)),
            None => Err(IndexError::NotFound {
                what: format!("indexed folder {key}"),
            }
            .into()),
        }
    }

    /// Register (or update the settings of) a folder and index everything in it.
    pub async fn index_folder(&self, path: &Path, settings: FolderSettings) -> Result<ScanReport> {
        let key = normalize_path(path)?;
        let span = info_span!("index_folder", folder = %key);
        async {
            match tokio::fs::metadata(&key).await {
                Ok(metadata) if metadata.is_dir() => {}
                Ok(_) => {
                    return Err(IndexError::InvalidPath {
                        path: key.clone(),
                        message: "not a directory".to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    return Err(IndexError::InvalidPath {
                        path: key.clone(),
                        message: e.to_string(),
                    }
                    .into());
                }
            }

            self.pipeline.clear_cancellation(&key);
            let folder = self.store.upsert_folder(&key, settings).await?;
            self.sync.refresh_folders().await?;
            let report = self.sync.scan_folder(&folder).await?;
            self.requeue_pending(Some(&key), TaskPriority::Normal).await?;
            self.watch(&folder);
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }

    /// Stop indexing a folder and remove everything indexed under it.
    pub async fn remove_folder(&self, path: &Path) -> Result<RemoveFolderReport> {
        let (key, _folder) = self.folder_key(path).await?;
        let mut report = RemoveFolderReport {
            folder: key.clone(),
            ..RemoveFolderReport::default()
        };

        if let Some(watchers) = &self.watchers {
            watchers.remove(&key);
        }
        report.cancelled_tasks = self.pipeline.cancel_scope(&key).await;
        self.store.delete_folder(&key).await?;
        self.sync.refresh_folders().await?;

        for file in self.store.files_under(&key).await? {
            // Files of a folder registered inside or around this one stay
            if self.sync.owning_folder(&file.path).is_some() {
                continue;
            }
            if file.status != FileStatus::Deleted {
                self.store.mark_deleted(file.id).await?;
                report.files_marked += 1;
            }
            match self.pipeline.cleanup_file(file.id).await {
                Ok(CleanupResult::Purged) => report.files_purged += 1,
                Ok(CleanupResult::NotNeeded) => {}
                Ok(CleanupResult::Busy) => {
                    self.pipeline.schedule_cleanup(file.id, &file.path).await?;
                    report.cleanup_pending += 1;
                }
                Err(e) => {
                    warn!("Cleanup of {} failed, will retry: {e:#}", file.path);
                    self.pipeline.schedule_cleanup(file.id, &file.path).await?;
                    report.cleanup_pending += 1;
                }
            }
        }

        info!(
            "Removed folder {key}: {} files purged, {} awaiting cleanup",
            report.files_purged, report.cleanup_pending
        );
        Ok(report)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let mut query = query.clone();
        if let Some(scope) = &query.scope {
            query.scope = Some(normalize_path(Path::new(scope))?);
        }
        self.search.search(&query).await
    }

    /// Progress for one folder, or for everything when `folder` is `None`.
    pub async fn get_indexing_status(&self, folder: Option<&Path>) -> Result<IndexingProgress> {
        let scope = match folder {
            Some(path) => Some(self.folder_key(path).await?.0),
            None => None,
        };
        let scope_ref = scope.as_deref();

        let counts = self.store.count_by_status(scope_ref).await?;
        let queued = match scope_ref {
            Some(scope) => self.pipeline.queued_in_scope(scope).await,
            None => self.pipeline.queued().await,
        };
        let in_flight: Vec<String> = self
            .pipeline
            .in_flight()
            .into_iter()
            .filter(|path| scope_ref.is_none_or(|scope| is_under(path, scope)))
            .collect();

        let max_failures = self.config.pipeline.max_consecutive_failures;
        let failures = self
            .store
            .list_files_by_status(FileStatus::Failed, scope_ref)
            .await?
            .iter()
            .map(|record| FileFailure::from_record(record, max_failures))
            .collect();
        let indexed = self
            .store
            .list_files_by_status(FileStatus::Indexed, scope_ref)
            .await?;
        let mean_completeness = if indexed.is_empty() {
            100.0
        } else {
            indexed.iter().map(|f| f.completeness()).sum::<f32>() / indexed.len() as f32
        };

        Ok(IndexingProgress {
            scope,
            percent_complete: percent_done(&counts),
            counts,
            queued,
            in_flight,
            mean_completeness,
            failures,
        })
    }

    /// Re-embed every file in a folder, e.g. after a chunking change.
    pub async fn reindex_folder(&self, path: &Path) -> Result<usize> {
        let (key, _) = self.folder_key(path).await?;
        self.pipeline.clear_cancellation(&key);
        let reset = self.store.reset_for_reembed(Some(&key)).await?;
        let queued = self.requeue_pending(Some(&key), TaskPriority::High).await?;
        info!("Re-indexing {key}: {reset} files reset, {queued} queued");
        Ok(queued)
    }

    /// Drop queued work under `path`. Files already being written finish normally; the
    /// rest stay pending until the folder is indexed again.
    pub async fn cancel_indexing(&self, path: &Path) -> Result<usize> {
        let key = normalize_path(path)?;
        Ok(self.pipeline.cancel_scope(&key).await)
    }

    pub async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        let mut folders = Vec::new();
        for folder in self.store.list_folders().await? {
            let counts = self.store.count_by_status(Some(&folder.path)).await?;
            let watching = self
                .watchers
                .as_ref()
                .is_some_and(|watchers| watchers.is_watching(&folder.path));
            folders.push(FolderInfo {
                path: folder.path,
                settings: folder.settings,
                created_at: folder.created_at,
                watching,
                counts,
            });
        }
        Ok(folders)
    }

    pub async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        self.store.recent_searches(limit).await
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        let store_ok = match self.store.integrity_check().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("Store integrity check failed: {e:#}");
                false
            }
        };
        if store_ok {
            self.pipeline.clear_degraded();
        }
        let embedding = self.gateway.health();
        let pending_cleanup = if store_ok {
            self.store.files_pending_cleanup(None).await?.len()
        } else {
            0
        };
        let store_degraded = self.pipeline.is_degraded();

        let status = if !store_ok {
            HealthStatus::Critical
        } else if store_degraded || embedding.breaker.state != BreakerState::Closed {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(EngineHealth {
            status,
            store_ok,
            store_degraded,
            embedding,
            pipeline: self.pipeline.stats(),
            sync: self.sync.stats(),
            queued: self.pipeline.queued().await,
            delayed: self.pipeline.delayed(),
            pending_cleanup,
            rebuilt_collections: self.rebuilt.clone(),
            watched_folders: self.watchers.as_ref().map_or(0, WatcherSet::len),
        })
    }

    /// Queue cleanup for every deleted file whose cleanup has not finished.
    pub async fn retry_cleanup(&self) -> Result<usize> {
        let files = self.store.files_pending_cleanup(None).await?;
        for file in &files {
            self.pipeline.schedule_cleanup(file.id, &file.path).await?;
        }
        Ok(files.len())
    }

    /// Cross-check indexed files against the vector store and queue repairs.
    pub async fn check_consistency(&self, scope: Option<&Path>) -> Result<ConsistencyReport> {
        let scope = scope.map(normalize_path).transpose()?;
        let files = self
            .store
            .list_files_by_status(FileStatus::Indexed, scope.as_deref())
            .await?;

        let mut issues = Vec::new();
        let mut repairs_queued = 0;
        for file in &files {
            let chunks = self.store.chunks_for_file(file.id).await?;
            let mut problems = Vec::new();

            if chunks.len() as i64 != file.chunk_count {
                problems.push(format!(
                    "{} chunk rows, {} recorded",
                    chunks.len(),
                    file.chunk_count
                ));
            }
            let vector_ids: Vec<String> =
                chunks.iter().filter_map(|c| c.vector_id.clone()).collect();
            let missing = self.vectors.missing(&vector_ids, Collection::Contents).await?;
            if !missing.is_empty() {
                problems.push(format!("{} content vectors missing", missing.len()));
            }
            if let Some(name_vector) = &file.filename_vector_id {
                let gone = self
                    .vectors
                    .missing(std::slice::from_ref(name_vector), Collection::Filenames)
                    .await?;
                if !gone.is_empty() {
                    problems.push("filename vector missing".to_string());
                }
            }

            if problems.is_empty() {
                continue;
            }
            for problem in problems {
                issues.push(ConsistencyIssue {
                    path: file.path.clone(),
                    problem,
                });
            }
            self.store.mark_status(file.id, FileStatus::Pending).await?;
            self.pipeline
                .submit_path(&file.path, TaskPriority::High)
                .await?;
            repairs_queued += 1;
        }

        if repairs_queued > 0 {
            warn!("Consistency check queued {repairs_queued} repairs");
        }
        Ok(ConsistencyReport {
            files_checked: files.len(),
            issues,
            repairs_queued,
            checked_at: Utc::now(),
        })
    }

    /// Feed a change from an external watcher into the sync engine.
    pub fn notify_change(&self, event: FsEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| IndexError::transient("sync engine is not running"))?;
        Ok(())
    }

    /// Wait until no indexing or cleanup work is queued, running or scheduled for retry.
    /// Filesystem events still inside the debounce window are not counted.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.pipeline.wait_until_idle(timeout).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn close(&self) {
        if let Some(watchers) = &self.watchers {
            watchers.clear();
        }
        let sync_task = self
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = sync_task {
            task.abort();
        }
        self.pipeline.shutdown().await;
        self.store.close().await;
        self.vectors.close().await;
        info!("Engine closed");
    }
}
