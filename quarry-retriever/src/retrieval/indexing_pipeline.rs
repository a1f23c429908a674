//! Per-file indexing: read → chunk → embed → persist.
//!
//! The pipeline owns a worker pool fed by a [`TaskQueue`]. Each run moves one file
//! through the stages below and ends in exactly one [`FileOutcome`]:
//!
//! ```text
//! pending → reading → chunking → embedding → persisting → indexed
//!              \_________\___________\___________\______→ failed
//! ```
//!
//! ## Guarantees
//!
//! - **One run per file.** A path is claimed before any work starts. A trigger that
//!   arrives while the path is claimed is remembered and replayed once the current run
//!   finishes, so bursts never produce concurrent runs or lost updates.
//! - **Atomic commit.** Vectors are written first (they are content-addressed and
//!   harmless on their own), then chunks, keyword entries and status commit in one
//!   metadata transaction. Vectors that lost their last reference are removed after.
//! - **Bounded work.** Reading, chunking and embedding share a per-file timeout; the
//!   commit itself is never interrupted.
//!
//! ## Failure policy
//!
//! | Kind | Reaction |
//! |---|---|
//! | backend unavailable | back to `pending`, retried after the breaker's cooldown |
//! | transient I/O | `failed`, retried with backoff until the failure limit |
//! | permanent content | `failed` at the limit; waits for the file to change |
//! | consistency violation | back to `pending`, repaired by a fresh run |
//! | store unavailable | global degraded flag, file left `pending` |

use anyhow::Result;
use half::f16;
use itertools::Itertools;
use quarry_embed::EmbeddingGateway;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::chunking_strategy::ChunkingStrategy;
use super::file_reader::{FileReader, ReadFailure};
use super::task_queue::{
    IndexingTask, QueueError, Submitted, TaskPriority, TaskQueue, TaskQueueConfig, TaskType,
};
use crate::error::{ContentFailure, ErrorKind, IndexError, error_kind};
use crate::storage::{
    Collection, FileCompletion, FileId, FileRecord, FileStatus, FolderId, MetadataStore,
    NewChunk, ReplaceOutcome, VectorIndex, content_vector_id, filename_vector_id, is_under,
};

/// Where a file is in its indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PipelineStage {
    Pending = 0,
    Reading = 1,
    Chunking = 2,
    Embedding = 3,
    Persisting = 4,
    Indexed = 5,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Reading => "reading",
            PipelineStage::Chunking => "chunking",
            PipelineStage::Embedding => "embedding",
            PipelineStage::Persisting => "persisting",
            PipelineStage::Indexed => "indexed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineStage::Reading,
            2 => PipelineStage::Chunking,
            3 => PipelineStage::Embedding,
            4 => PipelineStage::Persisting,
            5 => PipelineStage::Indexed,
            _ => PipelineStage::Pending,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the stage of a run that may be abandoned by a timeout.
#[derive(Debug, Default)]
struct StageCell(AtomicU8);

impl StageCell {
    fn set(&self, stage: PipelineStage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    fn get(&self) -> PipelineStage {
        PipelineStage::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// What to do when some chunks of a file could not be embedded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialIndexPolicy {
    /// Commit the file; chunks without a vector stay keyword-searchable
    #[default]
    AllowPartial,
    /// Fail the file unless every chunk has a vector
    RequireComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Files indexed in parallel
    pub workers: usize,
    /// Budget for reading, chunking and embedding one file
    pub file_timeout_ms: u64,
    /// Failed runs after which a file waits for a content change
    pub max_consecutive_failures: u32,
    pub partial_policy: PartialIndexPolicy,
    /// Delay before retrying when the backend gave no hint of its own
    pub backend_retry_delay_ms: u64,
    /// Base delay between retries of a transient failure, doubled per attempt
    pub retry_delay_ms: u64,
    pub max_queue_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            file_timeout_ms: 120_000,
            max_consecutive_failures: 3,
            partial_policy: PartialIndexPolicy::AllowPartial,
            backend_retry_delay_ms: 30_000,
            retry_delay_ms: 1_000,
            max_queue_size: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_file_timeout(mut self, timeout: Duration) -> Self {
        self.file_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_partial_policy(mut self, policy: PartialIndexPolicy) -> Self {
        self.partial_policy = policy;
        self
    }

    pub fn with_retry_delays(mut self, backend: Duration, transient: Duration) -> Self {
        self.backend_retry_delay_ms = backend.as_millis() as u64;
        self.retry_delay_ms = transient.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.workers == 0 {
            return Err(IndexError::invalid_config("pipeline.workers must be at least 1"));
        }
        if self.file_timeout_ms == 0 {
            return Err(IndexError::invalid_config(
                "pipeline.file_timeout_ms must be positive",
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(IndexError::invalid_config(
                "pipeline.max_consecutive_failures must be at least 1",
            ));
        }
        if self.max_queue_size == 0 {
            return Err(IndexError::invalid_config(
                "pipeline.max_queue_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// How a single run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Indexed {
        chunks: usize,
        /// Content vectors embedded by this run
        embedded: usize,
        /// Content vectors that already existed and were not embedded again
        reused: usize,
        completeness: f32,
    },
    /// Already indexed; nothing to do
    Unchanged,
    Failed {
        kind: ErrorKind,
        terminal: bool,
    },
    /// Embedding backend unavailable; the file stays pending
    Deferred {
        retry_after: Duration,
    },
    /// The file's scope was cancelled
    Cancelled,
    /// The file disappeared or was deleted during the run
    Vanished,
    /// A newer version of the file was observed mid-run; it will be indexed again
    Superseded,
    /// Another run holds the file; this trigger is replayed after it
    Busy,
    /// A deleted file's vectors and rows were removed
    CleanedUp,
    /// Unknown, deleted or terminally failed file
    Skipped,
}

#[derive(Debug, Default)]
struct PipelineStats {
    indexed: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    cancelled: AtomicU64,
    busy: AtomicU64,
    cleaned_up: AtomicU64,
    chunks_written: AtomicU64,
    vectors_embedded: AtomicU64,
    vectors_reused: AtomicU64,
}

/// Counters since the pipeline was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub indexed: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub deferred: u64,
    pub cancelled: u64,
    pub busy: u64,
    pub cleaned_up: u64,
    pub chunks_written: u64,
    pub vectors_embedded: u64,
    pub vectors_reused: u64,
}

impl PipelineStats {
    fn record(&self, outcome: &FileOutcome) {
        let counter = match outcome {
            FileOutcome::Indexed {
                chunks,
                embedded,
                reused,
                ..
            } => {
                self.chunks_written
                    .fetch_add(*chunks as u64, Ordering::Relaxed);
                self.vectors_embedded
                    .fetch_add(*embedded as u64, Ordering::Relaxed);
                self.vectors_reused
                    .fetch_add(*reused as u64, Ordering::Relaxed);
                &self.indexed
            }
            FileOutcome::Unchanged => &self.unchanged,
            FileOutcome::Failed { .. } => &self.failed,
            FileOutcome::Deferred { .. } => &self.deferred,
            FileOutcome::Cancelled => &self.cancelled,
            FileOutcome::Busy => &self.busy,
            FileOutcome::CleanedUp => &self.cleaned_up,
            FileOutcome::Vanished | FileOutcome::Superseded | FileOutcome::Skipped => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            indexed: load(&self.indexed),
            unchanged: load(&self.unchanged),
            failed: load(&self.failed),
            deferred: load(&self.deferred),
            cancelled: load(&self.cancelled),
            busy: load(&self.busy),
            cleaned_up: load(&self.cleaned_up),
            chunks_written: load(&self.chunks_written),
            vectors_embedded: load(&self.vectors_embedded),
            vectors_reused: load(&self.vectors_reused),
        }
    }
}

/// Everything computed before the commit.
struct PreparedFile {
    chunks: Vec<NewChunk>,
    new_vectors: Vec<(String, Vec<f16>)>,
    filename_vector: Option<Vec<f16>>,
    reused: usize,
}

/// Claimed paths, each with the trigger to replay once the current run ends.
type InFlight = Mutex<HashMap<String, Option<IndexingTask>>>;

struct ClaimGuard<'a> {
    in_flight: &'a InFlight,
    path: String,
    released: bool,
}

impl ClaimGuard<'_> {
    /// Release the claim, returning the trigger that arrived meanwhile, if any.
    fn release(mut self) -> Option<IndexingTask> {
        self.released = true;
        lock(self.in_flight).remove(&self.path).flatten()
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            lock(self.in_flight).remove(&self.path);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Text embedded for a file's name: separators become spaces so the name reads as words.
pub fn filename_text(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    name.split(|c: char| matches!(c, '_' | '-' | '.' | ' '))
        .filter(|part| !part.is_empty())
        .join(" ")
}

fn read_error(path: &str, failure: ReadFailure) -> IndexError {
    let stage = Some(PipelineStage::Reading);
    let content = |reason| IndexError::PermanentContent {
        path: path.to_string(),
        stage,
        reason,
    };
    match failure {
        ReadFailure::Unsupported => content(ContentFailure::Unsupported),
        ReadFailure::Corrupt(message) => content(ContentFailure::Corrupt(message)),
        ReadFailure::Unreadable(message) => content(ContentFailure::Unreadable(message)),
        ReadFailure::TooLarge { size, limit } => content(ContentFailure::TooLarge { size, limit }),
        ReadFailure::Vanished => IndexError::NotFound {
            what: path.to_string(),
        },
        ReadFailure::Transient(message) => IndexError::TransientIo {
            path: Some(path.to_string()),
            stage,
            message,
        },
    }
}

/// Drives files through the indexing stages on a bounded worker pool.
pub struct IndexingPipeline {
    store: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    gateway: Arc<EmbeddingGateway>,
    reader: Arc<dyn FileReader>,
    chunking: ChunkingStrategy,
    config: PipelineConfig,
    queue: Arc<TaskQueue>,
    in_flight: InFlight,
    cancelled_scopes: RwLock<Vec<String>>,
    // Tasks submitted or waiting on a retry timer that have not finished yet
    outstanding: Arc<AtomicUsize>,
    // The subset of `outstanding` still waiting on a timer
    delayed: Arc<AtomicUsize>,
    degraded: AtomicBool,
    stats: PipelineStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("config", &self.config)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .finish()
    }
}

impl IndexingPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        gateway: Arc<EmbeddingGateway>,
        reader: Arc<dyn FileReader>,
        chunking: ChunkingStrategy,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig {
            max_queue_size: config.max_queue_size,
        }));
        Ok(Self {
            store,
            vectors,
            gateway,
            reader,
            chunking,
            config,
            queue,
            in_flight: Mutex::new(HashMap::new()),
            cancelled_scopes: RwLock::new(Vec::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            delayed: Arc::new(AtomicUsize::new(0)),
            degraded: AtomicBool::new(false),
            stats: PipelineStats::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.workers {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pipeline.worker_loop(worker_id).await;
            }));
        }
        info!("Started {} indexing workers", self.config.workers);
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!("Worker {worker_id} started");
        while let Some(task) = self.queue.pop().await {
            let outcome = match &task.task_type {
                TaskType::IndexFile { .. } => self.run_index(&task).await,
                TaskType::Cleanup { file_id, path } => self.run_cleanup(&task, *file_id, path).await,
            };
            debug!("Worker {worker_id}: {} -> {outcome:?}", task.description());
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Worker {worker_id} stopped");
    }

    /// Close the queue and wait for the workers to finish their current file.
    pub async fn shutdown(&self) {
        self.queue.close().await;
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Indexing worker ended abnormally: {e}");
            }
        }
    }

    /// Queue a file for indexing.
    pub async fn submit_path(&self, path: &str, priority: TaskPriority) -> Result<Submitted> {
        self.submit(IndexingTask::index_file(path).with_priority(priority))
            .await
    }

    /// Queue removal of a deleted file's vectors and rows.
    pub async fn schedule_cleanup(&self, file_id: FileId, path: &str) -> Result<Submitted> {
        self.submit(IndexingTask::cleanup(file_id, path)).await
    }

    async fn submit(&self, task: IndexingTask) -> Result<Submitted> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.queue.submit(task).await {
            Ok(Submitted::Queued) => Ok(Submitted::Queued),
            Ok(Submitted::Merged) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                Ok(Submitted::Merged)
            }
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    async fn resubmit(&self, task: IndexingTask) {
        match self.submit(task).await {
            Ok(_) => {}
            Err(e) if matches!(e.downcast_ref::<QueueError>(), Some(QueueError::Closed)) => {
                debug!("Not requeueing, pipeline is shutting down")
            }
            Err(e) => warn!("Could not requeue task: {e}"),
        }
    }


    /// Resubmit `task` after `delay` without holding a worker.
    fn defer(&self, task: IndexingTask, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let outstanding = Arc::clone(&self.outstanding);
        let delayed = Arc::clone(&self.delayed);
        outstanding.fetch_add(1, Ordering::SeqCst);
        delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A queued task keeps its outstanding count until a worker finishes it
            let queued = matches!(queue.submit(task).await, Ok(Submitted::Queued));
            delayed.fetch_sub(1, Ordering::SeqCst);
            if !queued {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.config
                .retry_delay_ms
                .saturating_mul(1u64 << attempt.min(6)),
        )
    }

    /// Stop queued and future work under `scope`. Runs already past their commit point
    /// finish normally. Returns the number of queued tasks dropped.
    pub async fn cancel_scope(&self, scope: &str) -> usize {
        {
            let mut scopes = self
                .cancelled_scopes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !scopes.iter().any(|existing| existing == scope) {
                scopes.push(scope.to_string());
            }
        }
        let removed = self.queue.remove_scope(scope).await;
        self.outstanding.fetch_sub(removed, Ordering::SeqCst);
        info!("Cancelled indexing under {scope} ({removed} queued files dropped)");
        removed
    }

    /// Allow work under `scope` again.
    pub fn clear_cancellation(&self, scope: &str) {
        self.cancelled_scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !is_under(existing, scope));
    }

    pub fn is_cancelled(&self, path: &str) -> bool {
        self.cancelled_scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|scope| is_under(path, scope))
    }

    fn claim(&self, task: &IndexingTask) -> Option<ClaimGuard<'_>> {
        let path = task.path();
        let mut in_flight = lock(&self.in_flight);
        if let Some(rerun) = in_flight.get_mut(path) {
            if matches!(task.task_type, TaskType::IndexFile { .. }) {
                let keep_existing = rerun
                    .as_ref()
                    .is_some_and(|existing| existing.retry_count >= task.retry_count);
                if !keep_existing {
                    *rerun = Some(task.clone());
                }
            }
            return None;
        }
        in_flight.insert(path.to_string(), None);
        Some(ClaimGuard {
            in_flight: &self.in_flight,
            path: path.to_string(),
            released: false,
        })
    }

    /// Schedule another run of a path this caller has claimed.
    fn request_rerun(&self, task: IndexingTask) {
        if let Some(rerun) = lock(&self.in_flight).get_mut(task.path()) {
            *rerun = Some(task);
        }
    }

    /// Run the pipeline for one file now, on the caller's task.
    pub async fn index_path(&self, path: &str) -> FileOutcome {
        self.run_index(&IndexingTask::index_file(path)).await
    }

    async fn run_index(&self, task: &IndexingTask) -> FileOutcome {
        let path = task.path().to_string();
        let Some(claim) = self.claim(task) else {
            debug!("{path} is already being indexed; it will run again afterwards");
            self.stats.record(&FileOutcome::Busy);
            return FileOutcome::Busy;
        };

        let outcome = match self
            .index_claimed(task)
            .instrument(info_span!("index_file", path = %path))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => self.unhandled_failure(task, err),
        };

        if let Some(rerun) = claim.release() {
            self.resubmit(rerun).await;
        }
        self.stats.record(&outcome);
        outcome
    }

    /// Move a file to `status`; `false` if a concurrent change made that illegal.
    async fn transition(&self, id: FileId, status: FileStatus) -> Result<bool> {
        match self.store.mark_status(id, status).await {
            Ok(()) => Ok(true),
            Err(err) if error_kind(&err) == ErrorKind::ConsistencyViolation => {
                debug!("File {id} cannot move to {status}: {err}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn index_claimed(&self, task: &IndexingTask) -> Result<FileOutcome> {
        let path = task.path();
        if self.is_cancelled(path) {
            return Ok(FileOutcome::Cancelled);
        }

        let Some(record) = self.store.get_file(path).await? else {
            debug!("{path} is not tracked, skipping");
            return Ok(FileOutcome::Skipped);
        };
        let max_failures = self.config.max_consecutive_failures;
        match record.status {
            FileStatus::Deleted => return Ok(FileOutcome::Skipped),
            FileStatus::Indexed => return Ok(FileOutcome::Unchanged),
            FileStatus::Failed if record.is_terminal_failure(max_failures) => {
                debug!("{path} failed {} times, waiting for a change", record.failure_count);
                return Ok(FileOutcome::Skipped);
            }
            FileStatus::Failed => {
                if !self.transition(record.id, FileStatus::Pending).await? {
                    return Ok(FileOutcome::Skipped);
                }
            }
            FileStatus::Pending | FileStatus::Indexing => {}
        }
        if !self.transition(record.id, FileStatus::Indexing).await? {
            return Ok(FileOutcome::Skipped);
        }

        let index_content = self.folder_indexes_content(record.folder_id).await?;
        let stage = StageCell::default();
        let prepared = match tokio::time::timeout(
            self.config.file_timeout(),
            self.prepare(&record, index_content, &stage),
        )
        .await
        {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(err)) => return self.handle_failure(task, &record, stage.get(), err).await,
            Err(_) => return self.handle_timeout(&record, stage.get()).await,
        };

        if self.is_cancelled(path) {
            self.store.revert_to_pending(record.id).await?;
            return Ok(FileOutcome::Cancelled);
        }

        match self.persist(&record, prepared).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.handle_failure(task, &record, PipelineStage::Persisting, err)
                    .await
            }
        }
    }

    async fn folder_indexes_content(&self, folder_id: Option<FolderId>) -> Result<bool> {
        let Some(folder_id) = folder_id else {
            return Ok(true);
        };
        Ok(self
            .store
            .list_folders()
            .await?
            .into_iter()
            .find(|folder| folder.id == folder_id)
            .is_none_or(|folder| folder.settings.index_content))
    }

    /// Read, chunk and embed. Nothing is written here, so abandoning it is safe.
    async fn prepare(
        &self,
        record: &FileRecord,
        index_content: bool,
        stage: &StageCell,
    ) -> Result<PreparedFile> {
        let path = Path::new(&record.path);

        stage.set(PipelineStage::Reading);
        let text = if index_content && self.reader.supports(path) {
            match self.reader.read(path).await {
                Ok(text) => Some(text),
                // Sniffed as binary after all: index by name only
                Err(ReadFailure::Unsupported) => None,
                Err(failure) => return Err(read_error(&record.path, failure).into()),
            }
        } else {
            None
        };

        stage.set(PipelineStage::Chunking);
        let mut chunks: Vec<NewChunk> = text
            .as_deref()
            .map(|text| self.chunking.chunk_content(path, text))
            .unwrap_or_default()
            .into_iter()
            .map(|chunk| NewChunk {
                chunk_index: chunk.sequence as i64,
                start_offset: chunk.start as i64,
                end_offset: chunk.end as i64,
                overlap_start: chunk.overlap_start as i64,
                content_hash: chunk.hash,
                text: chunk.text,
                vector_id: None,
            })
            .collect();

        stage.set(PipelineStage::Embedding);
        let wanted: Vec<String> = chunks
            .iter()
            .map(|chunk| content_vector_id(&chunk.content_hash))
            .unique()
            .collect();
        let missing: HashSet<String> = if wanted.is_empty() {
            HashSet::new()
        } else {
            self.vectors
                .missing(&wanted, Collection::Contents)
                .await?
                .into_iter()
                .collect()
        };

        // One text per vector that does not exist yet, then the file name
        let to_embed: Vec<(String, &str)> = chunks
            .iter()
            .map(|chunk| (content_vector_id(&chunk.content_hash), chunk.text.as_str()))
            .filter(|(vector_id, _)| missing.contains(vector_id))
            .unique_by(|(vector_id, _)| vector_id.clone())
            .collect();
        let mut texts: Vec<String> = to_embed.iter().map(|(_, text)| text.to_string()).collect();
        texts.push(filename_text(&record.path));

        let result = self.gateway.embed(&texts).await.map_err(IndexError::from)?;
        let mut items = result.items.into_iter();
        let mut new_vectors = Vec::with_capacity(to_embed.len());
        let mut rejected = HashSet::new();
        for ((vector_id, _), item) in to_embed.into_iter().zip(items.by_ref()) {
            match item {
                Ok(vector) => new_vectors.push((vector_id, vector)),
                Err(failure) => {
                    debug!("No embedding for a chunk of {}: {failure}", record.path);
                    rejected.insert(vector_id);
                }
            }
        }
        let filename_vector = match items.next() {
            Some(Ok(vector)) => Some(vector),
            Some(Err(failure)) => {
                warn!("No filename embedding for {}: {failure}", record.path);
                None
            }
            None => None,
        };

        for chunk in &mut chunks {
            let vector_id = content_vector_id(&chunk.content_hash);
            if !rejected.contains(&vector_id) {
                chunk.vector_id = Some(vector_id);
            }
        }

        let embedded = chunks.iter().filter(|c| c.vector_id.is_some()).count();
        if embedded < chunks.len() {
            if self.config.partial_policy == PartialIndexPolicy::RequireComplete {
                return Err(IndexError::PermanentContent {
                    path: record.path.clone(),
                    stage: Some(PipelineStage::Embedding),
                    reason: ContentFailure::IncompleteEmbeddings {
                        embedded,
                        total: chunks.len(),
                    },
                }
                .into());
            }
            warn!(
                "Indexing {} partially: {} of {} chunks have embeddings",
                record.path,
                embedded,
                chunks.len()
            );
        }

        Ok(PreparedFile {
            reused: wanted.len() - missing.len(),
            chunks,
            new_vectors,
            filename_vector,
        })
    }

    async fn persist(&self, record: &FileRecord, prepared: PreparedFile) -> Result<FileOutcome> {
        let PreparedFile {
            chunks,
            new_vectors,
            filename_vector,
            reused,
        } = prepared;

        if !new_vectors.is_empty() {
            self.vectors
                .upsert_many(&new_vectors, Collection::Contents)
                .await?;
        }
        let name_vector_id = filename_vector_id(record.id);
        let stored_name_vector = match &filename_vector {
            Some(vector) => {
                self.vectors
                    .upsert(&name_vector_id, vector, Collection::Filenames)
                    .await?;
                Some(name_vector_id)
            }
            None => {
                // The old vector would still match the previous name
                if record.filename_vector_id.is_some() {
                    self.vectors.delete(&name_vector_id).await?;
                }
                None
            }
        };

        let completion = FileCompletion {
            content_hash: record.content_hash.clone().unwrap_or_default(),
            size: record.size,
            mtime: record.mtime,
            filename_vector_id: stored_name_vector.clone(),
        };
        let written: Vec<String> = new_vectors.iter().map(|(id, _)| id.clone()).collect();

        match self
            .store
            .replace_chunks(record.id, &chunks, &completion)
            .await?
        {
            ReplaceOutcome::Committed { orphaned_vectors } => {
                if !orphaned_vectors.is_empty() {
                    if let Err(e) = self.vectors.delete_many(&orphaned_vectors).await {
                        warn!(
                            "Could not remove {} unreferenced vectors: {e:#}",
                            orphaned_vectors.len()
                        );
                    }
                }
            }
            ReplaceOutcome::FileDeleted => {
                debug!("{} was deleted during indexing", record.path);
                self.discard_unreferenced(&written, stored_name_vector.as_deref())
                    .await;
                return Ok(FileOutcome::Vanished);
            }
            ReplaceOutcome::Superseded => {
                debug!("{} changed during indexing; the newer version will be indexed", record.path);
                self.discard_unreferenced(&written, None).await;
                return Ok(FileOutcome::Superseded);
            }
        }

        // Another file's cleanup may have removed a shared vector since it was checked
        let referenced: Vec<String> = chunks
            .iter()
            .filter_map(|chunk| chunk.vector_id.clone())
            .unique()
            .collect();
        if !referenced.is_empty() {
            let missing = self
                .vectors
                .missing(&referenced, Collection::Contents)
                .await?;
            if !missing.is_empty() {
                return Err(IndexError::consistency(
                    Some(record.path.clone()),
                    format!(
                        "{} of {} content vectors missing after commit",
                        missing.len(),
                        referenced.len()
                    ),
                )
                .into());
            }
        }

        let with_vectors = chunks.iter().filter(|c| c.vector_id.is_some()).count();
        let completeness = if chunks.is_empty() {
            100.0
        } else {
            with_vectors as f32 / chunks.len() as f32 * 100.0
        };
        info!(
            "Indexed {} ({} chunks, {} embedded, {} reused)",
            record.path,
            chunks.len(),
            new_vectors.len(),
            reused
        );
        Ok(FileOutcome::Indexed {
            chunks: chunks.len(),
            embedded: new_vectors.len(),
            reused,
            completeness,
        })
    }

    /// Drop vectors written by an abandoned run unless some chunk already uses them.
    async fn discard_unreferenced(&self, vector_ids: &[String], filename_vector: Option<&str>) {
        let mut unused = Vec::new();
        for vector_id in vector_ids {
            match self.store.vector_ref_count(vector_id).await {
                Ok(0) => unused.push(vector_id.clone()),
                Ok(_) => {}
                Err(e) => warn!("Could not check references to {vector_id}: {e:#}"),
            }
        }
        unused.extend(filename_vector.map(str::to_string));
        if !unused.is_empty() {
            if let Err(e) = self.vectors.delete_many(&unused).await {
                warn!("Could not remove {} abandoned vectors: {e:#}", unused.len());
            }
        }
    }

    async fn handle_failure(
        &self,
        task: &IndexingTask,
        record: &FileRecord,
        stage: PipelineStage,
        err: anyhow::Error,
    ) -> Result<FileOutcome> {
        let kind = error_kind(&err);
        let max_failures = self.config.max_consecutive_failures;
        let cause = format!("{err:#}");

        match kind {
            ErrorKind::BackendUnavailable => {
                let retry_after = err
                    .chain()
                    .find_map(|cause| cause.downcast_ref::<IndexError>())
                    .and_then(IndexError::retry_after)
                    .filter(|wait| !wait.is_zero())
                    .unwrap_or(Duration::from_millis(self.config.backend_retry_delay_ms));
                self.store.revert_to_pending(record.id).await?;
                info!(path = %record.path, %stage, "Embedding backend unavailable, retrying in {retry_after:?}");
                self.defer(task.clone(), retry_after);
                Ok(FileOutcome::Deferred { retry_after })
            }
            ErrorKind::NotFound => {
                debug!("{} vanished during {stage}", record.path);
                self.store.mark_deleted(record.id).await?;
                self.schedule_cleanup(record.id, &record.path).await?;
                Ok(FileOutcome::Vanished)
            }
            ErrorKind::ConsistencyViolation if task.should_retry(max_failures) => {
                warn!(path = %record.path, %stage, %cause, "Store inconsistency, indexing the file again");
                let current = self.store.get_file_by_id(record.id).await?;
                if current.is_some_and(|file| {
                    matches!(file.status, FileStatus::Indexing | FileStatus::Indexed)
                }) {
                    self.store.mark_status(record.id, FileStatus::Pending).await?;
                    self.request_rerun(task.retry());
                }
                Ok(FileOutcome::Failed {
                    kind,
                    terminal: false,
                })
            }
            ErrorKind::PermanentContent => {
                warn!(path = %record.path, %stage, %cause, "File content cannot be indexed");
                self.record_run_failure(record, &cause, true).await?;
                Ok(FileOutcome::Failed {
                    kind,
                    terminal: true,
                })
            }
            ErrorKind::StoreUnavailable => {
                error!(path = %record.path, %stage, %cause, "Store unavailable, entering degraded mode");
                self.degraded.store(true, Ordering::SeqCst);
                if let Err(e) = self.store.revert_to_pending(record.id).await {
                    debug!("Could not reset {}: {e:#}", record.path);
                }
                Ok(FileOutcome::Failed {
                    kind,
                    terminal: false,
                })
            }
            ErrorKind::ConsistencyViolation => {
                error!(path = %record.path, %stage, %cause, "Store inconsistency persists, giving up for now");
                let current = self.store.get_file_by_id(record.id).await?;
                let terminal = match current.map(|file| file.status) {
                    // Committed but unrepaired: leave it for the next scan or restart
                    Some(FileStatus::Indexed) => {
                        self.store.mark_status(record.id, FileStatus::Pending).await?;
                        false
                    }
                    Some(FileStatus::Indexing) => self
                        .record_run_failure(record, &cause, false)
                        .await?
                        .is_some_and(|failures| failures >= i64::from(max_failures)),
                    _ => false,
                };
                Ok(FileOutcome::Failed { kind, terminal })
            }
            _ => {
                warn!(path = %record.path, %stage, %cause, "Indexing failed");
                let Some(failures) = self.record_run_failure(record, &cause, false).await? else {
                    return Ok(FileOutcome::Failed {
                        kind,
                        terminal: false,
                    });
                };
                let terminal = failures >= i64::from(max_failures);
                if !terminal {
                    self.defer(task.retry(), self.retry_delay(task.retry_count));
                }
                Ok(FileOutcome::Failed { kind, terminal })
            }
        }
    }

    async fn handle_timeout(&self, record: &FileRecord, stage: PipelineStage) -> Result<FileOutcome> {
        let message = format!(
            "timed out after {:?} during {stage}",
            self.config.file_timeout()
        );
        warn!(path = %record.path, %stage, "Indexing {message}");
        let max_failures = self.config.max_consecutive_failures;
        let failures = self.record_run_failure(record, &message, false).await?;
        Ok(FileOutcome::Failed {
            kind: ErrorKind::TransientIo,
            terminal: failures.is_some_and(|failures| failures >= i64::from(max_failures)),
        })
    }

    /// Mark a run as failed. `None` when the file moved on (a newer version was
    /// observed) and the failure no longer applies to it.
    async fn record_run_failure(
        &self,
        record: &FileRecord,
        message: &str,
        terminal: bool,
    ) -> Result<Option<i64>> {
        let max_failures = self.config.max_consecutive_failures;
        match self
            .store
            .record_failure(record.id, message, terminal, max_failures)
            .await
        {
            Ok(failures) => Ok(Some(failures)),
            Err(e) if error_kind(&e) == ErrorKind::ConsistencyViolation => {
                debug!("Not recording failure for {}: {e:#}", record.path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Errors raised outside the per-file policy, typically by the stores themselves.
    fn unhandled_failure(&self, task: &IndexingTask, err: anyhow::Error) -> FileOutcome {
        let kind = error_kind(&err);
        match kind {
            ErrorKind::StoreUnavailable => {
                error!("Store unavailable while processing {}: {err:#}", task.path());
                self.degraded.store(true, Ordering::SeqCst);
            }
            ErrorKind::TransientIo if task.should_retry(self.config.max_consecutive_failures) => {
                warn!("Retrying {} after: {err:#}", task.path());
                self.defer(task.retry(), self.retry_delay(task.retry_count));
            }
            _ => error!("Could not process {}: {err:#}", task.path()),
        }
        FileOutcome::Failed {
            kind,
            terminal: false,
        }
    }

    async fn run_cleanup(&self, task: &IndexingTask, file_id: FileId, path: &str) -> FileOutcome {
        let outcome = match self.cleanup_file(file_id).await {
            Ok(CleanupResult::Purged) => FileOutcome::CleanedUp,
            Ok(CleanupResult::NotNeeded) => FileOutcome::Skipped,
            Ok(CleanupResult::Busy) => {
                self.defer(task.clone(), self.retry_delay(0));
                FileOutcome::Busy
            }
            Err(err) => {
                // The file keeps its cleanup flag, so a later sweep also finds it
                warn!("Cleanup of {path} failed: {err:#}");
                if task.should_retry(self.config.max_consecutive_failures) {
                    self.defer(task.retry(), self.retry_delay(task.retry_count));
                }
                FileOutcome::Failed {
                    kind: error_kind(&err),
                    terminal: false,
                }
            }
        };
        self.stats.record(&outcome);
        outcome
    }

    /// Remove a deleted file's vectors, then its chunks, keyword entries and row.
    ///
    /// Vectors go first: if the metadata step fails the file stays flagged and the
    /// next attempt finds an empty plan instead of losing track of live vectors.
    pub async fn cleanup_file(&self, file_id: FileId) -> Result<CleanupResult> {
        let Some(record) = self.store.get_file_by_id(file_id).await? else {
            return Ok(CleanupResult::NotNeeded);
        };
        if record.status != FileStatus::Deleted || !record.needs_cleanup {
            return Ok(CleanupResult::NotNeeded);
        }
        let Some(claim) = self.claim(&IndexingTask::cleanup(file_id, record.path.clone())) else {
            return Ok(CleanupResult::Busy);
        };

        let result = async {
            let plan = self.store.cleanup_plan(file_id).await?;
            if !plan.is_empty() {
                self.vectors.delete_many(&plan).await?;
            }
            self.store.purge_file(file_id).await?;
            Ok::<_, anyhow::Error>(plan.len())
        }
        .await;

        if let Some(rerun) = claim.release() {
            self.resubmit(rerun).await;
        }
        let removed = result?;
        debug!("Cleaned up {} ({removed} vectors removed)", record.path);
        Ok(CleanupResult::Purged)
    }

    /// Put files left `indexing` by an interrupted process back to `pending`.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let stuck = self
            .store
            .list_files_by_status(FileStatus::Indexing, None)
            .await?;
        let mut recovered = Vec::with_capacity(stuck.len());
        for file in stuck {
            if self.store.revert_to_pending(file.id).await? {
                recovered.push(file.path);
            }
        }
        if !recovered.is_empty() {
            info!("Recovered {} interrupted files", recovered.len());
        }
        Ok(recovered)
    }

    /// Wait until nothing is queued, running or waiting to be retried.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.outstanding.load(Ordering::SeqCst) == 0 && lock(&self.in_flight).is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn queued(&self) -> usize {
        self.queue.len().await
    }

    pub async fn queued_in_scope(&self, scope: &str) -> usize {
        self.queue.len_in_scope(scope).await
    }

    pub fn in_flight(&self) -> Vec<String> {
        lock(&self.in_flight).keys().cloned().collect()
    }

    /// Retries waiting on a timer, e.g. for the embedding backend to come back.
    pub fn delayed(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn clear_degraded(&self) {
        self.degraded.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupResult {
    Purged,
    /// Not deleted, already purged, or not flagged
    NotNeeded,
    /// The path is being indexed; try again later
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::chunking_strategy::ChunkingConfig;
    use crate::retrieval::file_reader::MockFileReader;
    use crate::storage::sqlite_store::SqliteStore;
    use crate::storage::vector_store::SqliteVectorStore;
    use crate::storage::{FileObservation, KeywordIndex};
    use quarry_embed::{
        CircuitBreakerConfig, GatewayConfig, MockEmbeddingBackend, MockFailure, RetryConfig,
    };

    struct Harness {
        store: Arc<SqliteStore>,
        vectors: Arc<SqliteVectorStore>,
        backend: Arc<MockEmbeddingBackend>,
        reader: Arc<MockFileReader>,
        pipeline: Arc<IndexingPipeline>,
    }

    async fn harness(config: PipelineConfig) -> Harness {
        let backend = Arc::new(MockEmbeddingBackend::new(64));
        let gateway_config = GatewayConfig::default()
            .with_retry(RetryConfig {
                max_attempts: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            })
            .with_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 60_000,
                ..CircuitBreakerConfig::default()
            });
        let gateway = Arc::new(EmbeddingGateway::new(backend.clone(), gateway_config).unwrap());
        let store = Arc::new(SqliteStore::open_memory().await.unwrap());
        let vectors = Arc::new(
            SqliteVectorStore::open_memory(gateway.model())
                .await
                .unwrap(),
        );
        let reader = Arc::new(MockFileReader::new());
        let chunking =
            ChunkingStrategy::new(ChunkingConfig::default().with_max_chunk_size(80)).unwrap();
        let pipeline = Arc::new(
            IndexingPipeline::new(
                store.clone(),
                vectors.clone(),
                gateway,
                reader.clone(),
                chunking,
                config,
            )
            .unwrap(),
        );
        Harness {
            store,
            vectors,
            backend,
            reader,
            pipeline,
        }
    }

    async fn track(store: &SqliteStore, path: &str, hash: &str) -> FileRecord {
        store
            .upsert_file(&FileObservation {
                path: path.to_string(),
                size: 100,
                mtime: 1_700_000_000_000,
                content_hash: hash.to_string(),
                folder_id: None,
            })
            .await
            .unwrap()
    }

    const REPORT: &str = "Quarterly revenue grew in the northern region.\n\n\
        Operating costs stayed flat while hiring slowed.\n\n\
        The board approved the budget for the next fiscal year.";

    #[tokio::test]
    async fn test_index_file_commits_everything() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        let file = track(&h.store, "/docs/report.txt", "h1").await;

        let outcome = h.pipeline.index_path("/docs/report.txt").await;
        let FileOutcome::Indexed {
            chunks,
            completeness,
            ..
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(chunks > 1);
        assert_eq!(completeness, 100.0);

        let record = h.store.get_file_by_id(file.id).await?.unwrap();
        assert_eq!(record.status, FileStatus::Indexed);
        assert_eq!(record.chunk_count as usize, chunks);
        assert_eq!(record.filename_vector_id, Some(filename_vector_id(file.id)));

        let stored = h.store.chunks_for_file(file.id).await?;
        let vector_ids: Vec<String> = stored.iter().filter_map(|c| c.vector_id.clone()).collect();
        assert!(h.vectors.missing(&vector_ids, Collection::Contents).await?.is_empty());
        assert_eq!(h.vectors.count(Collection::Filenames).await?, 1);

        let hits = KeywordIndex::search(h.store.as_ref(), "budget", 10, None).await?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_triggers_never_overlap() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        h.reader.set_delay(Some(Duration::from_millis(50)));
        track(&h.store, "/docs/report.txt", "h1").await;

        let (first, second) = tokio::join!(
            h.pipeline.index_path("/docs/report.txt"),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                h.pipeline.index_path("/docs/report.txt").await
            }
        );

        assert!(matches!(first, FileOutcome::Indexed { .. }));
        assert_eq!(second, FileOutcome::Busy);
        assert_eq!(h.reader.overlapping_reads(), 0);
        assert_eq!(h.reader.reads_of(Path::new("/docs/report.txt")), 1);
        // The second trigger is replayed once the first run is done
        assert_eq!(h.pipeline.queued().await, 1);

        let file = h.store.get_file("/docs/report.txt").await?.unwrap();
        let chunks = h.store.chunks_for_file(file.id).await?;
        let indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, (0..chunks.len() as i64).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_content_reuses_vectors() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        track(&h.store, "/docs/report.txt", "h1").await;
        h.pipeline.index_path("/docs/report.txt").await;
        let embedded_before = h.backend.texts_embedded();

        // Touched on disk: pending again with the same bytes
        track(&h.store, "/docs/report.txt", "h1").await;
        let outcome = h.pipeline.index_path("/docs/report.txt").await;
        let FileOutcome::Indexed {
            chunks,
            embedded,
            reused,
            ..
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(embedded, 0);
        assert_eq!(reused, chunks);
        // Only the file name was embedded again
        assert_eq!(h.backend.texts_embedded(), embedded_before + 1);

        // A second file with the same text shares the vectors
        h.reader.insert("/docs/copy.txt", REPORT);
        track(&h.store, "/docs/copy.txt", "h1").await;
        let outcome = h.pipeline.index_path("/docs/copy.txt").await;
        assert!(matches!(outcome, FileOutcome::Indexed { embedded: 0, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_backend_outage_defers_without_failing() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        let file = track(&h.store, "/docs/report.txt", "h1").await;
        h.backend.set_failure(Some(MockFailure::Unavailable));

        let outcome = h.pipeline.index_path("/docs/report.txt").await;
        assert!(matches!(outcome, FileOutcome::Deferred { .. }));

        let record = h.store.get_file_by_id(file.id).await?.unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(record.failure_count, 0);
        assert_eq!(h.pipeline.delayed(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_terminally() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.fail("/docs/scan.pdf", ReadFailure::Corrupt("bad xref table".into()));
        let file = track(&h.store, "/docs/scan.pdf", "h1").await;

        let outcome = h.pipeline.index_path("/docs/scan.pdf").await;
        assert_eq!(
            outcome,
            FileOutcome::Failed {
                kind: ErrorKind::PermanentContent,
                terminal: true
            }
        );
        let record = h.store.get_file_by_id(file.id).await?.unwrap();
        assert_eq!(record.status, FileStatus::Failed);
        assert!(record.last_error.unwrap().contains("bad xref table"));

        // Not retried until the file changes
        assert_eq!(h.pipeline.index_path("/docs/scan.pdf").await, FileOutcome::Skipped);
        assert_eq!(h.reader.reads_of(Path::new("/docs/scan.pdf")), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_file_times_out() -> anyhow::Result<()> {
        let config = PipelineConfig::default().with_file_timeout(Duration::from_millis(20));
        let h = harness(config).await;
        h.reader.insert("/docs/huge.txt", REPORT);
        h.reader.set_delay(Some(Duration::from_millis(500)));
        let file = track(&h.store, "/docs/huge.txt", "h1").await;

        let outcome = h.pipeline.index_path("/docs/huge.txt").await;
        assert_eq!(
            outcome,
            FileOutcome::Failed {
                kind: ErrorKind::TransientIo,
                terminal: false
            }
        );
        let record = h.store.get_file_by_id(file.id).await?.unwrap();
        assert_eq!(record.status, FileStatus::Failed);
        assert!(record.last_error.unwrap().contains("reading"));
        Ok(())
    }

    #[tokio::test]
    async fn test_require_complete_policy() -> anyhow::Result<()> {
        let config =
            PipelineConfig::default().with_partial_policy(PartialIndexPolicy::RequireComplete);
        let h = harness(config).await;
        h.reader.insert("/docs/report.txt", REPORT);
        h.backend.reject_items_containing("board");
        track(&h.store, "/docs/report.txt", "h1").await;

        let outcome = h.pipeline.index_path("/docs/report.txt").await;
        assert!(matches!(
            outcome,
            FileOutcome::Failed {
                kind: ErrorKind::PermanentContent,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_embeddings_are_allowed_by_default() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        h.backend.reject_items_containing("board");
        let file = track(&h.store, "/docs/report.txt", "h1").await;

        let outcome = h.pipeline.index_path("/docs/report.txt").await;
        let FileOutcome::Indexed { completeness, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(completeness < 100.0);
        let record = h.store.get_file_by_id(file.id).await?.unwrap();
        assert!(record.embedded_chunks < record.chunk_count);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_removes_all_traces() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        let file = track(&h.store, "/docs/report.txt", "h1").await;
        h.pipeline.index_path("/docs/report.txt").await;

        h.store.mark_deleted(file.id).await?;
        assert_eq!(h.pipeline.cleanup_file(file.id).await?, CleanupResult::Purged);

        assert!(h.store.get_file_by_id(file.id).await?.is_none());
        assert_eq!(h.vectors.count(Collection::Contents).await?, 0);
        assert_eq!(h.vectors.count(Collection::Filenames).await?, 0);
        assert_eq!(
            h.pipeline.cleanup_file(file.id).await?,
            CleanupResult::NotNeeded
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_scope_is_skipped() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default()).await;
        h.reader.insert("/docs/report.txt", REPORT);
        track(&h.store, "/docs/report.txt", "h1").await;
        h.pipeline
            .submit_path("/docs/report.txt", TaskPriority::Normal)
            .await?;

        assert_eq!(h.pipeline.cancel_scope("/docs").await, 1);
        assert_eq!(h.pipeline.queued().await, 0);
        assert_eq!(h.pipeline.index_path("/docs/report.txt").await, FileOutcome::Cancelled);
        assert_eq!(h.reader.total_reads(), 0);

        h.pipeline.clear_cancellation("/docs");
        assert!(matches!(
            h.pipeline.index_path("/docs/report.txt").await,
            FileOutcome::Indexed { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_workers_drain_the_queue() -> anyhow::Result<()> {
        let h = harness(PipelineConfig::default().with_workers(2)).await;
        for i in 0..5 {
            let path = format!("/docs/note-{i}.txt");
            h.reader.insert(path.as_str(), format!("note number {i} about budgets"));
            track(&h.store, &path, &format!("h{i}")).await;
            h.pipeline.submit_path(&path, TaskPriority::Normal).await?;
        }

        h.pipeline.start();
        assert!(h.pipeline.wait_until_idle(Duration::from_secs(5)).await);
        assert_eq!(h.pipeline.stats().indexed, 5);
        assert_eq!(h.store.count_by_status(None).await?.indexed, 5);
        h.pipeline.shutdown().await;
        Ok(())
    }

    #[test]
    fn test_filename_text() {
        assert_eq!(filename_text("/docs/quarterly_report-2024.pdf"), "quarterly report 2024 pdf");
        assert_eq!(filename_text("/docs/README"), "README");
    }
}
