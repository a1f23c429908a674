use chrono::{DateTime, Utc};
use quarry_embed::GatewayHealth;
use serde::Serialize;

use crate::retrieval::indexing_pipeline::PipelineStatsSnapshot;
use crate::retrieval::sync_engine::SyncStatsSnapshot;
use crate::storage::{Collection, FileRecord, FolderSettings, StatusCounts};

/// A failed file, with enough context to triage it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: Option<String>,
    pub failure_count: i64,
    /// Retries stopped; the file waits for its content to change
    pub terminal: bool,
}

impl FileFailure {
    pub fn from_record(record: &FileRecord, max_failures: u32) -> Self {
        Self {
            path: record.path.clone(),
            error: record.last_error.clone(),
            failure_count: record.failure_count,
            terminal: record.is_terminal_failure(max_failures),
        }
    }
}

/// Indexing progress for one folder (or everything).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexingProgress {
    pub scope: Option<String>,
    pub counts: StatusCounts,
    /// Files waiting in the queue for this scope
    pub queued: usize,
    /// Files being indexed right now
    pub in_flight: Vec<String>,
    /// Files done (indexed or failed) out of all live files
    pub percent_complete: f32,
    /// Mean embedding completeness of indexed files
    pub mean_completeness: f32,
    pub failures: Vec<FileFailure>,
}

impl IndexingProgress {
    /// Nothing is pending, queued or running.
    pub fn is_complete(&self) -> bool {
        self.counts.pending == 0
            && self.counts.indexing == 0
            && self.queued == 0
            && self.in_flight.is_empty()
    }
}

pub(crate) fn percent_done(counts: &StatusCounts) -> f32 {
    let live = counts.live();
    if live == 0 {
        return 100.0;
    }
    (counts.indexed + counts.failed) as f32 / live as f32 * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderInfo {
    pub path: String,
    pub settings: FolderSettings,
    pub created_at: DateTime<Utc>,
    pub watching: bool,
    pub counts: StatusCounts,
}

/// What `remove_folder` did. Files whose cleanup could not finish stay flagged and are
/// retried later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoveFolderReport {
    pub folder: String,
    pub cancelled_tasks: usize,
    pub files_marked: usize,
    pub files_purged: usize,
    pub cleanup_pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Searches work but some part is impaired (backend down, cleanup backlog)
    Degraded,
    /// The metadata store cannot be used
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub store_ok: bool,
    /// A store error was seen during indexing since the last healthy check
    pub store_degraded: bool,
    pub embedding: GatewayHealth,
    pub pipeline: PipelineStatsSnapshot,
    pub sync: SyncStatsSnapshot,
    pub queued: usize,
    /// Retries waiting for their delay to pass
    pub delayed: usize,
    pub pending_cleanup: usize,
    /// Vector collections cleared at startup because the model changed
    pub rebuilt_collections: Vec<Collection>,
    pub watched_folders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyIssue {
    pub path: String,
    pub problem: String,
}

/// Result of cross-checking the metadata store against the vector store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub files_checked: usize,
    pub issues: Vec<ConsistencyIssue>,
    /// Files queued for a repair re-index
    pub repairs_queued: usize,
    pub checked_at: DateTime<Utc>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}
