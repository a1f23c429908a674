//! Storage contracts for quarry-retriever
//!
//! Three stores back the engine, each behind a trait so the pipeline and search code
//! never touch SQL directly:
//!
//! - **MetadataStore**: files, directories, chunks, indexed folders, search history.
//!   The source of truth for what is indexed and in which state.
//! - **KeywordIndex**: full-text search over chunk text, kept in the same database as
//!   the metadata so it commits with the chunks it describes.
//! - **VectorIndex**: nearest-neighbour search over embeddings, in two collections
//!   (`filenames` and `contents`).
//!
//! ## Architecture
//!
//! ```text
//! MetadataStore ─┐
//!                ├─ SqliteStore        (quarry.db: metadata + FTS5)
//! KeywordIndex ──┘
//! VectorIndex ───── SqliteVectorStore  (vectors.db: f16 blobs, brute-force cosine)
//! ```
//!
//! ## Vector identifiers
//!
//! Content vectors are addressed by chunk content hash (`content:<hash>`), so identical
//! chunks in different files share one vector and a moved file keeps its embeddings.
//! Filename vectors are addressed by file id (`filename:<id>`). A content vector is
//! deleted only once no chunk references it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};
use std::str::FromStr;

pub mod sqlite_store;
pub mod vector_store;

pub type FileId = i64;
pub type ChunkId = i64;
pub type FolderId = i64;

/// Lifecycle of a tracked file.
///
/// Transitions only move forward, except that a failed file may be retried, a file
/// whose content changed goes back to pending, and anything may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Indexing => "indexing",
            FileStatus::Indexed => "indexed",
            FileStatus::Failed => "failed",
            FileStatus::Deleted => "deleted",
        }
    }

    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        if self == next || next == Deleted {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Indexing)
                | (Indexing, Indexed)
                | (Indexing, Failed)
                | (Indexing, Pending)
                | (Failed, Pending)
                | (Indexed, Pending)
                | (Deleted, Pending)
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "indexing" => Ok(FileStatus::Indexing),
            "indexed" => Ok(FileStatus::Indexed),
            "failed" => Ok(FileStatus::Failed),
            "deleted" => Ok(FileStatus::Deleted),
            other => Err(anyhow::anyhow!("Unknown file status: {other}")),
        }
    }
}

/// A tracked file as stored in the metadata database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub filename: String,
    pub directory_id: i64,
    pub folder_id: Option<FolderId>,
    pub size: i64,
    /// Modification time, milliseconds since the Unix epoch
    pub mtime: i64,
    pub content_hash: Option<String>,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub embedded_chunks: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
    pub needs_cleanup: bool,
    pub filename_vector_id: Option<String>,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Share of chunks that have an embedding, as a percentage.
    pub fn completeness(&self) -> f32 {
        if self.chunk_count == 0 {
            return 100.0;
        }
        (self.embedded_chunks as f32 / self.chunk_count as f32) * 100.0
    }

    pub fn is_terminal_failure(&self, max_failures: u32) -> bool {
        self.status == FileStatus::Failed && self.failure_count >= i64::from(max_failures)
    }
}

/// What the sync engine saw on disk for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileObservation {
    pub path: String,
    pub size: i64,
    pub mtime: i64,
    pub content_hash: String,
    pub folder_id: Option<FolderId>,
}

/// Everything written to a file's row when its chunks are committed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCompletion {
    pub content_hash: String,
    pub size: i64,
    pub mtime: i64,
    pub filename_vector_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub file_id: FileId,
    pub chunk_index: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub overlap_start: i64,
    pub content_hash: String,
    pub text: String,
    pub vector_id: Option<String>,
}

/// A chunk about to be written; ids are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub overlap_start: i64,
    pub content_hash: String,
    pub text: String,
    pub vector_id: Option<String>,
}

/// Result of an atomic chunk replacement.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    /// Chunks and status committed; these vector ids lost their last reference
    Committed { orphaned_vectors: Vec<String> },
    /// The file was deleted while it was being indexed; nothing was written
    FileDeleted,
    /// The file is no longer `indexing` (a newer version was observed); nothing was written
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderSettings {
    pub include_hidden: bool,
    pub index_content: bool,
    pub recursive: bool,
}

impl Default for FolderSettings {
    fn default() -> Self {
        Self {
            include_hidden: false,
            index_content: true,
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub path: String,
    pub settings: FolderSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHistoryEntry {
    pub id: i64,
    pub query: String,
    pub mode: String,
    pub result_count: i64,
    pub searched_at: DateTime<Utc>,
}

/// Per-status file counts for a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub indexing: u64,
    pub indexed: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl StatusCounts {
    /// Files that are still tracked, i.e. everything except deleted ones.
    pub fn live(&self) -> u64 {
        self.pending + self.indexing + self.indexed + self.failed
    }

    pub(crate) fn add(&mut self, status: FileStatus, count: u64) {
        match status {
            FileStatus::Pending => self.pending += count,
            FileStatus::Indexing => self.indexing += count,
            FileStatus::Indexed => self.indexed += count,
            FileStatus::Failed => self.failed += count,
            FileStatus::Deleted => self.deleted += count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Filenames,
    Contents,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Filenames, Collection::Contents];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Filenames => "filenames",
            Collection::Contents => "contents",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn content_vector_id(chunk_hash: &str) -> String {
    format!("content:{chunk_hash}")
}

pub fn filename_vector_id(file_id: FileId) -> String {
    format!("filename:{file_id}")
}

/// Parse a `filename:<id>` vector id back into a file id.
pub fn file_id_from_vector_id(vector_id: &str) -> Option<FileId> {
    vector_id.strip_prefix("filename:")?.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: ChunkId,
    /// Higher is better (negated bm25)
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub vector_id: String,
    /// Cosine distance, lower is closer
    pub distance: f32,
}

/// Normalize a path into the key the stores use: absolute, with `.` and `..`
/// resolved lexically, and case-folded on case-insensitive platforms.
pub fn normalize_path(path: &Path) -> Result<String> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    let mut key = normalized.to_string_lossy().into_owned();
    if key.len() > 1 && key.ends_with(MAIN_SEPARATOR) {
        key.pop();
    }
    if cfg!(windows) {
        key = key.to_lowercase();
    }
    Ok(key)
}

/// Whether `path` is `scope` itself or lies underneath it.
pub fn is_under(path: &str, scope: &str) -> bool {
    match path.strip_prefix(scope) {
        Some("") => true,
        Some(rest) => scope.ends_with(MAIN_SEPARATOR) || rest.starts_with(MAIN_SEPARATOR),
        None => false,
    }
}

/// Prefix used in SQL to match descendants of a scope.
pub(crate) fn scope_prefix(scope: &str) -> String {
    if scope.ends_with(MAIN_SEPARATOR) {
        scope.to_string()
    } else {
        format!("{scope}{MAIN_SEPARATOR}")
    }
}

/// File and chunk bookkeeping. See module docs for the overall model.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or update a file from a disk observation, resetting it to pending
    async fn upsert_file(&self, observation: &FileObservation) -> Result<FileRecord>;

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Id of the `directories` row for `path`, creating it on first use.
    /// The path is normalized first, so equivalent spellings share one row.
    async fn directory_id_for(&self, path: &str) -> Result<i64>;

    async fn get_file_by_id(&self, id: FileId) -> Result<Option<FileRecord>>;

    async fn files_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileRecord>>;

    /// Move a file to `status`, rejecting transitions the lifecycle does not allow
    async fn mark_status(&self, id: FileId, status: FileStatus) -> Result<()>;

    /// Put a file that is still `indexing` back to `pending`; returns whether it changed
    async fn revert_to_pending(&self, id: FileId) -> Result<bool>;

    /// Record a failed run; `terminal` failures jump straight to the retry limit.
    /// Returns the new failure count.
    async fn record_failure(
        &self,
        id: FileId,
        message: &str,
        terminal: bool,
        max_failures: u32,
    ) -> Result<i64>;

    /// Update size and mtime without touching status (metadata-only change)
    async fn touch_file(&self, id: FileId, size: i64, mtime: i64) -> Result<()>;

    /// Atomically swap a file's chunks, keyword entries and status
    async fn replace_chunks(
        &self,
        file_id: FileId,
        chunks: &[NewChunk],
        completion: &FileCompletion,
    ) -> Result<ReplaceOutcome>;

    async fn chunks_for_file(&self, file_id: FileId) -> Result<Vec<ChunkRecord>>;

    async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>>;

    async fn chunks_by_vector_ids(&self, vector_ids: &[String]) -> Result<Vec<ChunkRecord>>;

    /// Number of chunks, across all files, that reference `vector_id`
    async fn vector_ref_count(&self, vector_id: &str) -> Result<i64>;

    async fn list_files_by_status(
        &self,
        status: FileStatus,
        scope: Option<&str>,
    ) -> Result<Vec<FileRecord>>;

    /// Every file at or under `prefix`, in any state
    async fn files_under(&self, prefix: &str) -> Result<Vec<FileRecord>>;

    async fn count_by_status(&self, scope: Option<&str>) -> Result<StatusCounts>;

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<FileRecord>>;

    async fn find_by_path_substring(
        &self,
        needle: &str,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileRecord>>;

    /// Point an existing record at a new path (move/rename), keeping its chunks
    async fn rename_file(&self, id: FileId, observation: &FileObservation) -> Result<FileRecord>;

    /// Mark deleted and flag for vector/chunk cleanup
    async fn mark_deleted(&self, id: FileId) -> Result<()>;

    async fn files_pending_cleanup(&self, scope: Option<&str>) -> Result<Vec<FileRecord>>;

    /// Vector ids that will have no remaining reference once this file is purged
    async fn cleanup_plan(&self, id: FileId) -> Result<Vec<String>>;

    /// Physically remove a deleted file with its chunks and keyword entries; a no-op
    /// for files that are no longer deleted
    async fn purge_file(&self, id: FileId) -> Result<()>;

    /// Send indexed and failed files back to pending so they are embedded again
    async fn reset_for_reembed(&self, scope: Option<&str>) -> Result<u64>;

    async fn upsert_folder(&self, path: &str, settings: FolderSettings) -> Result<FolderRecord>;

    async fn get_folder(&self, path: &str) -> Result<Option<FolderRecord>>;

    async fn list_folders(&self) -> Result<Vec<FolderRecord>>;

    async fn delete_folder(&self, path: &str) -> Result<bool>;

    async fn record_search(&self, query: &str, mode: &str, result_count: usize) -> Result<()>;

    async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>>;

    /// Run the database's own integrity check
    async fn integrity_check(&self) -> Result<bool>;
}

/// Full-text search over chunk text.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn index_chunk(&self, chunk_id: ChunkId, text: &str) -> Result<()>;

    async fn remove_chunks(&self, file_id: FileId) -> Result<()>;

    /// Ranked chunk hits for free text; `scope` restricts to files under a path
    async fn search(&self, query: &str, limit: usize, scope: Option<&str>)
    -> Result<Vec<KeywordHit>>;
}

/// Nearest-neighbour search over embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        vector_id: &str,
        embedding: &[half::f16],
        collection: Collection,
    ) -> Result<()>;

    async fn upsert_many(
        &self,
        entries: &[(String, Vec<half::f16>)],
        collection: Collection,
    ) -> Result<()>;

    async fn delete(&self, vector_id: &str) -> Result<()>;

    async fn delete_many(&self, vector_ids: &[String]) -> Result<()>;

    /// `k` closest vectors by cosine distance. Fails with a configuration mismatch when
    /// `model_id` is not the model the collection was built with.
    async fn search(
        &self,
        query: &[half::f16],
        k: usize,
        collection: Collection,
        model_id: &str,
    ) -> Result<Vec<VectorHit>>;

    /// The subset of `vector_ids` not present in `collection`
    async fn missing(&self, vector_ids: &[String], collection: Collection) -> Result<Vec<String>>;

    async fn count(&self, collection: Collection) -> Result<usize>;

    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use FileStatus::*;
        assert!(Pending.can_transition_to(Indexing));
        assert!(Indexing.can_transition_to(Indexed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Indexed.can_transition_to(Deleted));
        assert!(Deleted.can_transition_to(Pending));

        assert!(!Indexed.can_transition_to(Indexing));
        assert!(!Failed.can_transition_to(Indexed));
        assert!(!Pending.can_transition_to(Indexed));
        assert!(!Deleted.can_transition_to(Indexed));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            FileStatus::Pending,
            FileStatus::Indexing,
            FileStatus::Indexed,
            FileStatus::Failed,
            FileStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<FileStatus>().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_path_resolves_dots() {
        let key = normalize_path(Path::new("/data/notes/./drafts/../todo.md")).unwrap();
        assert_eq!(key, "/data/notes/todo.md");

        let dir = normalize_path(Path::new("/data/notes/")).unwrap();
        assert_eq!(dir, "/data/notes");
    }

    #[cfg(unix)]
    #[test]
    fn test_is_under_respects_component_boundaries() {
        assert!(is_under("/data/notes/a.md", "/data/notes"));
        assert!(is_under("/data/notes", "/data/notes"));
        assert!(!is_under("/data/notes-old/a.md", "/data/notes"));
        assert!(!is_under("/data", "/data/notes"));
    }

    #[test]
    fn test_vector_ids() {
        assert_eq!(content_vector_id("abc"), "content:abc");
        assert_eq!(filename_vector_id(42), "filename:42");
        assert_eq!(file_id_from_vector_id("filename:42"), Some(42));
        assert_eq!(file_id_from_vector_id("content:42"), None);
    }

    #[test]
    fn test_completeness() {
        let mut record = FileRecord {
            id: 1,
            path: "/a.txt".into(),
            filename: "a.txt".into(),
            directory_id: 1,
            folder_id: None,
            size: 10,
            mtime: 0,
            content_hash: None,
            status: FileStatus::Indexed,
            chunk_count: 4,
            embedded_chunks: 3,
            failure_count: 0,
            last_error: None,
            needs_cleanup: false,
            filename_vector_id: None,
            last_indexed_at: None,
        };
        assert_eq!(record.completeness(), 75.0);
        record.chunk_count = 0;
        assert_eq!(record.completeness(), 100.0);
    }
}
