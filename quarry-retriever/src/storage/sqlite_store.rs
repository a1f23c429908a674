//! SQLite implementation of the metadata store and keyword index.
//!
//! Files, directories, chunks, folders and search history live in one database next
//! to an FTS5 table over chunk text. Replacing a file's chunks rewrites its keyword
//! entries and its status inside the same transaction, so readers never see chunks
//! without a matching status or keyword rows for chunks that are gone.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE files (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     path TEXT UNIQUE NOT NULL,        -- normalized absolute path
//!     filename TEXT NOT NULL,
//!     directory_id INTEGER NOT NULL REFERENCES directories(id),
//!     folder_id INTEGER REFERENCES indexed_folders(id) ON DELETE SET NULL,
//!     size INTEGER, mtime INTEGER,      -- mtime in ms since the epoch
//!     content_hash TEXT,                -- blake3 of the bytes on disk
//!     status TEXT,                      -- pending/indexing/indexed/failed/deleted
//!     chunk_count INTEGER, embedded_chunks INTEGER,
//!     failure_count INTEGER, last_error TEXT,
//!     needs_cleanup INTEGER,            -- deleted, vectors not yet removed
//!     ...
//! );
//!
//! CREATE TABLE chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     file_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
//!     chunk_index INTEGER, start_offset INTEGER, end_offset INTEGER, overlap_start INTEGER,
//!     content_hash TEXT, text TEXT,
//!     vector_id TEXT,                   -- content:<hash>, NULL if embedding failed
//!     UNIQUE(file_id, chunk_index)
//! );
//!
//! CREATE VIRTUAL TABLE chunks_fts USING fts5(text, tokenize = 'porter unicode61 remove_diacritics 1');
//! ```

use super::{
    ChunkId, ChunkRecord, FileCompletion, FileId, FileObservation, FileRecord, FileStatus,
    FolderRecord, FolderSettings, KeywordHit, KeywordIndex, MetadataStore, NewChunk,
    ReplaceOutcome, SearchHistoryEntry, StatusCounts, normalize_path, scope_prefix,
};
use crate::error::IndexError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: i64 = 1;

const FILE_COLUMNS: &str = "id, path, filename, directory_id, folder_id, size, mtime, \
     content_hash, status, chunk_count, embedded_chunks, failure_count, last_error, \
     needs_cleanup, filename_vector_id, last_indexed_at";

const CHUNK_COLUMNS: &str = "id, file_id, chunk_index, start_offset, end_offset, \
     overlap_start, content_hash, text, vector_id";

// Bookkeeping columns that databases from before schema_meta lack
const FILES_V1_COLUMNS: &[(&str, &str)] = &[
    ("embedded_chunks", "INTEGER NOT NULL DEFAULT 0"),
    ("needs_cleanup", "INTEGER NOT NULL DEFAULT 0"),
    ("filename_vector_id", "TEXT"),
    ("last_indexed_at", "TIMESTAMP"),
];

// Keeps IN (...) lists well under SQLite's bound-parameter limit
const BIND_BATCH: usize = 500;

/// Metadata and keyword storage backed by one SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true),
            )
            .await
            .map_err(|e| IndexError::StoreUnavailable {
                message: format!("cannot open {}: {e}", db_path.display()),
            })?;

        Self::new_with_pool(pool, Some(db_path.to_path_buf())).await
    }

    /// In-memory database for tests. A single connection keeps every query on the
    /// same database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool, None).await
    }

    async fn new_with_pool(pool: SqlitePool, db_path: Option<PathBuf>) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Self::check_schema_version(&pool).await?;
        Self::create_indexes(&pool).await?;
        Ok(Self { pool, db_path })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                include_hidden INTEGER NOT NULL DEFAULT 0,
                index_content INTEGER NOT NULL DEFAULT 1,
                recursive INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                filename TEXT NOT NULL,
                directory_id INTEGER NOT NULL REFERENCES directories(id),
                folder_id INTEGER REFERENCES indexed_folders(id) ON DELETE SET NULL,
                size INTEGER NOT NULL DEFAULT 0,
                mtime INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                chunk_count INTEGER NOT NULL DEFAULT 0,
                embedded_chunks INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                needs_cleanup INTEGER NOT NULL DEFAULT 0,
                filename_vector_id TEXT,
                last_indexed_at TIMESTAMP,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                overlap_start INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                text TEXT NOT NULL,
                vector_id TEXT,
                CONSTRAINT unique_chunk UNIQUE(file_id, chunk_index)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query TEXT NOT NULL,
                mode TEXT NOT NULL,
                result_count INTEGER NOT NULL,
                searched_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(\
             text, tokenize = 'porter unicode61 remove_diacritics 1')",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn create_indexes(pool: &SqlitePool) -> Result<()> {
        for index in [
            "CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)",
            "CREATE INDEX IF NOT EXISTS idx_files_content_hash ON files(content_hash)",
            "CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id)",
            "CREATE INDEX IF NOT EXISTS idx_files_cleanup ON files(needs_cleanup)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_vector ON chunks(vector_id)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }

        Ok(())
    }

    async fn check_schema_version(pool: &SqlitePool) -> Result<()> {
        let row = sqlx::query("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;

        // No row: a fresh database or one written before schema_meta existed
        let version = match row {
            None => 0,
            Some(row) => {
                let value: String = row.try_get("value")?;
                value.parse::<i64>().map_err(|_| {
                    IndexError::mismatch(format!("unreadable metadata schema version {value:?}"))
                })?
            }
        };

        if version > SCHEMA_VERSION {
            return Err(IndexError::mismatch(format!(
                "metadata schema version {version}, expected at most {SCHEMA_VERSION}"
            ))
            .into());
        }
        if version < SCHEMA_VERSION {
            Self::migrate(pool, version).await?;
        }
        Ok(())
    }

    /// Upgrades the schema from `from` to [`SCHEMA_VERSION`] in one transaction.
    async fn migrate(pool: &SqlitePool, from: i64) -> Result<()> {
        let mut tx = pool.begin().await?;

        if from < 1 {
            let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info('files')")
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| row.try_get::<String, _>("name"))
                .collect::<Result<_, _>>()?;
            for (column, definition) in FILES_V1_COLUMNS {
                if !existing.iter().any(|name| name == column) {
                    sqlx::query(&format!("ALTER TABLE files ADD COLUMN {column} {definition}"))
                        .execute(&mut *tx)
                        .await?;
                    info!("Added files.{column}");
                }
            }
        }

        sqlx::query(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(SCHEMA_VERSION.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Metadata schema at version {SCHEMA_VERSION} (was {from})");
        Ok(())
    }

    async fn directory_id(conn: &mut SqliteConnection, dir: &str) -> Result<i64> {
        sqlx::query("INSERT INTO directories (path) VALUES (?1) ON CONFLICT(path) DO NOTHING")
            .bind(dir)
            .execute(&mut *conn)
            .await?;
        let row = sqlx::query("SELECT id FROM directories WHERE path = ?1")
            .bind(dir)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn fts_insert(conn: &mut SqliteConnection, chunk_id: ChunkId, text: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE rowid = ?1")
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)")
            .bind(chunk_id)
            .bind(text)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn fts_remove_file(conn: &mut SqliteConnection, file_id: FileId) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?1)")
            .bind(file_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn status_of(conn: &mut SqliteConnection, id: FileId) -> Result<Option<FileStatus>> {
        let row = sqlx::query("SELECT status FROM files WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("status")?.parse()?)),
            None => Ok(None),
        }
    }

    async fn fetch_files(&self, sql: &str, scope: Option<&str>) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(sql)
            .bind(scope)
            .bind(scope.map(scope_prefix))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn chunks_where_in<T>(&self, column: &str, values: &[T]) -> Result<Vec<ChunkRecord>>
    where
        T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Clone + Send + Sync + 'static,
    {
        let mut chunks = Vec::new();
        for batch in values.chunks(BIND_BATCH) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE {column} IN ("));
            let mut separated = builder.separated(", ");
            for value in batch {
                separated.push_bind(value.clone());
            }
            separated.push_unseparated(") ORDER BY id");
            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                chunks.push(chunk_from_row(row)?);
            }
        }
        Ok(chunks)
    }
}

// Matches files at or under an optional scope bound as ?1 (path) and ?2 (path + separator)
const SCOPE_FILTER: &str = "(?1 IS NULL OR path = ?1 OR substr(path, 1, length(?2)) = ?2)";

fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let dir = p
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    (dir, filename)
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let status: String = row.try_get("status")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        filename: row.try_get("filename")?,
        directory_id: row.try_get("directory_id")?,
        folder_id: row.try_get("folder_id")?,
        size: row.try_get("size")?,
        mtime: row.try_get("mtime")?,
        content_hash: row.try_get("content_hash")?,
        status: status.parse()?,
        chunk_count: row.try_get("chunk_count")?,
        embedded_chunks: row.try_get("embedded_chunks")?,
        failure_count: row.try_get("failure_count")?,
        last_error: row.try_get("last_error")?,
        needs_cleanup: row.try_get("needs_cleanup")?,
        filename_vector_id: row.try_get("filename_vector_id")?,
        last_indexed_at: row.try_get("last_indexed_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        chunk_index: row.try_get("chunk_index")?,
        start_offset: row.try_get("start_offset")?,
        end_offset: row.try_get("end_offset")?,
        overlap_start: row.try_get("overlap_start")?,
        content_hash: row.try_get("content_hash")?,
        text: row.try_get("text")?,
        vector_id: row.try_get("vector_id")?,
    })
}

fn folder_from_row(row: &SqliteRow) -> Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        settings: FolderSettings {
            include_hidden: row.try_get("include_hidden")?,
            index_content: row.try_get("index_content")?,
            recursive: row.try_get("recursive")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

/// Turn free text into an FTS5 query: each word quoted, any word may match.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert_file(&self, observation: &FileObservation) -> Result<FileRecord> {
        let (dir, filename) = split_path(&observation.path);
        let mut tx = self.pool.begin().await?;
        let directory_id = Self::directory_id(&mut tx, &dir).await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO files (path, filename, directory_id, folder_id, size, mtime, content_hash,
                               status, failure_count, last_error, needs_cleanup, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, NULL, 0, ?8)
            ON CONFLICT(path) DO UPDATE SET
                filename = excluded.filename,
                directory_id = excluded.directory_id,
                folder_id = excluded.folder_id,
                size = excluded.size,
                mtime = excluded.mtime,
                content_hash = excluded.content_hash,
                status = 'pending',
                failure_count = 0,
                last_error = NULL,
                needs_cleanup = 0,
                updated_at = excluded.updated_at
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(&observation.path)
        .bind(&filename)
        .bind(directory_id)
        .bind(observation.folder_id)
        .bind(observation.size)
        .bind(observation.mtime)
        .bind(&observation.content_hash)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let record = file_from_row(&row)?;

        tx.commit().await?;
        debug!("Upserted file {} as pending", record.path);
        Ok(record)
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn directory_id_for(&self, path: &str) -> Result<i64> {
        let dir = normalize_path(Path::new(path))?;
        let mut conn = self.pool.acquire().await?;
        Self::directory_id(&mut conn, &dir).await
    }

    async fn get_file_by_id(&self, id: FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn files_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileRecord>> {
        let mut files = Vec::with_capacity(ids.len());
        for batch in ids.chunks(BIND_BATCH) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {FILE_COLUMNS} FROM files WHERE id IN ("));
            let mut separated = builder.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                files.push(file_from_row(row)?);
            }
        }
        Ok(files)
    }

    async fn mark_status(&self, id: FileId, status: FileStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = Self::status_of(&mut tx, id).await?.ok_or_else(|| IndexError::NotFound {
            what: format!("file {id}"),
        })?;

        if !current.can_transition_to(status) {
            return Err(IndexError::consistency(
                None,
                format!("illegal status transition {current} -> {status} for file {id}"),
            )
            .into());
        }

        sqlx::query("UPDATE files SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert_to_pending(&self, id: FileId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', updated_at = ?1 WHERE id = ?2 AND status = 'indexing'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        id: FileId,
        message: &str,
        terminal: bool,
        max_failures: u32,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let current = match Self::status_of(&mut tx, id).await? {
            None | Some(FileStatus::Deleted) => {
                tx.rollback().await?;
                return Ok(0);
            }
            Some(status) => status,
        };
        if !current.can_transition_to(FileStatus::Failed) {
            tx.rollback().await?;
            return Err(IndexError::consistency(
                None,
                format!("illegal status transition {current} -> failed for file {id}"),
            )
            .into());
        }

        let row = sqlx::query(
            r#"
            UPDATE files SET
                status = 'failed',
                failure_count = CASE WHEN ?1 THEN MAX(failure_count + 1, ?2) ELSE failure_count + 1 END,
                last_error = ?3,
                updated_at = ?4
            WHERE id = ?5
            RETURNING failure_count
            "#,
        )
        .bind(terminal)
        .bind(i64::from(max_failures))
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let failures = row.try_get("failure_count")?;
        tx.commit().await?;
        Ok(failures)
    }

    async fn touch_file(&self, id: FileId, size: i64, mtime: i64) -> Result<()> {
        sqlx::query("UPDATE files SET size = ?1, mtime = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(size)
            .bind(mtime)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_chunks(
        &self,
        file_id: FileId,
        chunks: &[NewChunk],
        completion: &FileCompletion,
    ) -> Result<ReplaceOutcome> {
        let mut tx = self.pool.begin().await?;

        match Self::status_of(&mut tx, file_id).await? {
            None => {
                return Err(IndexError::NotFound {
                    what: format!("file {file_id}"),
                }
                .into());
            }
            Some(FileStatus::Deleted) => {
                tx.rollback().await?;
                return Ok(ReplaceOutcome::FileDeleted);
            }
            Some(FileStatus::Indexing) => {}
            Some(_) => {
                // A newer observation reset the file while this run was working
                tx.rollback().await?;
                return Ok(ReplaceOutcome::Superseded);
            }
        }

        let old_vectors: Vec<String> = sqlx::query(
            "SELECT DISTINCT vector_id FROM chunks WHERE file_id = ?1 AND vector_id IS NOT NULL",
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get("vector_id"))
        .collect::<Result<_, _>>()?;

        Self::fts_remove_file(&mut tx, file_id).await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let result = sqlx::query(
                r#"
                INSERT INTO chunks (file_id, chunk_index, start_offset, end_offset, overlap_start,
                                    content_hash, text, vector_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(file_id)
            .bind(chunk.chunk_index)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.overlap_start)
            .bind(&chunk.content_hash)
            .bind(&chunk.text)
            .bind(&chunk.vector_id)
            .execute(&mut *tx)
            .await?;
            Self::fts_insert(&mut tx, result.last_insert_rowid(), &chunk.text).await?;
        }

        let embedded = chunks.iter().filter(|c| c.vector_id.is_some()).count() as i64;
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE files SET
                status = 'indexed',
                content_hash = ?1,
                size = ?2,
                mtime = ?3,
                chunk_count = ?4,
                embedded_chunks = ?5,
                filename_vector_id = ?6,
                failure_count = 0,
                last_error = NULL,
                last_indexed_at = ?7,
                updated_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(&completion.content_hash)
        .bind(completion.size)
        .bind(completion.mtime)
        .bind(chunks.len() as i64)
        .bind(embedded)
        .bind(&completion.filename_vector_id)
        .bind(now)
        .bind(file_id)
        .execute(&mut *tx)
        .await?;

        let mut orphaned_vectors = Vec::new();
        for vector_id in old_vectors {
            let row = sqlx::query("SELECT COUNT(*) AS refs FROM chunks WHERE vector_id = ?1")
                .bind(&vector_id)
                .fetch_one(&mut *tx)
                .await?;
            if row.try_get::<i64, _>("refs")? == 0 {
                orphaned_vectors.push(vector_id);
            }
        }

        tx.commit().await?;
        Ok(ReplaceOutcome::Committed { orphaned_vectors })
    }

    async fn chunks_for_file(&self, file_id: FileId) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ?1 ORDER BY chunk_index"
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>> {
        self.chunks_where_in("id", ids).await
    }

    async fn chunks_by_vector_ids(&self, vector_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        self.chunks_where_in("vector_id", vector_ids).await
    }

    async fn vector_ref_count(&self, vector_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS refs FROM chunks WHERE vector_id = ?1")
            .bind(vector_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("refs")?)
    }

    async fn list_files_by_status(
        &self,
        status: FileStatus,
        scope: Option<&str>,
    ) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE {SCOPE_FILTER} AND status = ?3 ORDER BY path"
        ))
        .bind(scope)
        .bind(scope.map(scope_prefix))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn files_under(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        self.fetch_files(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE {SCOPE_FILTER} ORDER BY path"),
            Some(prefix),
        )
        .await
    }

    async fn count_by_status(&self, scope: Option<&str>) -> Result<StatusCounts> {
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS n FROM files WHERE {SCOPE_FILTER} GROUP BY status"
        ))
        .bind(scope)
        .bind(scope.map(scope_prefix))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.add(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE content_hash = ?1 ORDER BY updated_at DESC"
        ))
        .bind(content_hash)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn find_by_path_substring(
        &self,
        needle: &str,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        // instr() avoids LIKE wildcard escaping; lower() on both sides for case folding
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM files
            WHERE {SCOPE_FILTER}
              AND status != 'deleted'
              AND instr(lower(path), lower(?3)) > 0
            ORDER BY instr(lower(filename), lower(?3)) = 0, length(path), path
            LIMIT ?4
            "#
        ))
        .bind(scope)
        .bind(scope.map(scope_prefix))
        .bind(needle)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn rename_file(&self, id: FileId, observation: &FileObservation) -> Result<FileRecord> {
        let (dir, filename) = split_path(&observation.path);
        let mut tx = self.pool.begin().await?;
        let directory_id = Self::directory_id(&mut tx, &dir).await?;

        // A stale record may still sit at the destination; the moved one replaces it
        let stale: Option<FileId> = sqlx::query("SELECT id FROM files WHERE path = ?1 AND id != ?2")
            .bind(&observation.path)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;
        if let Some(stale_id) = stale {
            Self::fts_remove_file(&mut tx, stale_id).await?;
            sqlx::query("DELETE FROM files WHERE id = ?1")
                .bind(stale_id)
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE files SET
                path = ?1, filename = ?2, directory_id = ?3, folder_id = ?4,
                size = ?5, mtime = ?6, content_hash = ?7,
                status = 'pending', needs_cleanup = 0, failure_count = 0, last_error = NULL,
                updated_at = ?8
            WHERE id = ?9
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(&observation.path)
        .bind(&filename)
        .bind(directory_id)
        .bind(observation.folder_id)
        .bind(observation.size)
        .bind(observation.mtime)
        .bind(&observation.content_hash)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IndexError::NotFound {
            what: format!("file {id}"),
        })?;
        let record = file_from_row(&row)?;

        tx.commit().await?;
        Ok(record)
    }

    async fn mark_deleted(&self, id: FileId) -> Result<()> {
        sqlx::query(
            "UPDATE files SET status = 'deleted', needs_cleanup = 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn files_pending_cleanup(&self, scope: Option<&str>) -> Result<Vec<FileRecord>> {
        self.fetch_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE {SCOPE_FILTER} AND needs_cleanup = 1 ORDER BY id"
            ),
            scope,
        )
        .await
    }

    async fn cleanup_plan(&self, id: FileId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT c.vector_id FROM chunks c
            WHERE c.file_id = ?1
              AND c.vector_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM chunks o WHERE o.vector_id = c.vector_id AND o.file_id != ?1
              )
            ORDER BY c.vector_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut plan: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("vector_id"))
            .collect::<Result<_, _>>()?;
        if let Some(file) = self.get_file_by_id(id).await? {
            if let Some(filename_vector) = file.filename_vector_id {
                plan.push(filename_vector);
            }
        }
        Ok(plan)
    }

    async fn purge_file(&self, id: FileId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // The path may have been re-created since the file was marked deleted
        if Self::status_of(&mut tx, id).await? != Some(FileStatus::Deleted) {
            tx.rollback().await?;
            return Ok(());
        }
        Self::fts_remove_file(&mut tx, id).await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_for_reembed(&self, scope: Option<&str>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE files SET status = 'pending', failure_count = 0, last_error = NULL, updated_at = ?3
            WHERE {SCOPE_FILTER} AND status IN ('indexed', 'failed', 'indexing')
            "#
        ))
        .bind(scope)
        .bind(scope.map(scope_prefix))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_folder(&self, path: &str, settings: FolderSettings) -> Result<FolderRecord> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO indexed_folders (path, include_hidden, index_content, recursive, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(path) DO UPDATE SET
                include_hidden = excluded.include_hidden,
                index_content = excluded.index_content,
                recursive = excluded.recursive,
                updated_at = excluded.updated_at
            RETURNING id, path, include_hidden, index_content, recursive, created_at
            "#,
        )
        .bind(path)
        .bind(settings.include_hidden)
        .bind(settings.index_content)
        .bind(settings.recursive)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        folder_from_row(&row)
    }

    async fn get_folder(&self, path: &str) -> Result<Option<FolderRecord>> {
        let row = sqlx::query(
            "SELECT id, path, include_hidden, index_content, recursive, created_at \
             FROM indexed_folders WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    async fn list_folders(&self) -> Result<Vec<FolderRecord>> {
        let rows = sqlx::query(
            "SELECT id, path, include_hidden, index_content, recursive, created_at \
             FROM indexed_folders ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(folder_from_row).collect()
    }

    async fn delete_folder(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM indexed_folders WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_search(&self, query: &str, mode: &str, result_count: usize) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_history (query, mode, result_count, searched_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(query)
        .bind(mode)
        .bind(result_count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, query, mode, result_count, searched_at FROM search_history \
             ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SearchHistoryEntry {
                    id: row.try_get("id")?,
                    query: row.try_get("query")?,
                    mode: row.try_get("mode")?,
                    result_count: row.try_get("result_count")?,
                    searched_at: row.try_get("searched_at")?,
                })
            })
            .collect()
    }

    async fn integrity_check(&self) -> Result<bool> {
        let row = sqlx::query("PRAGMA quick_check").fetch_one(&self.pool).await?;
        let verdict: String = row.try_get(0)?;
        if verdict != "ok" {
            warn!("Metadata integrity check failed: {verdict}");
        }
        Ok(verdict == "ok")
    }
}

#[async_trait]
impl KeywordIndex for SqliteStore {
    async fn index_chunk(&self, chunk_id: ChunkId, text: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::fts_insert(&mut conn, chunk_id, text).await
    }

    async fn remove_chunks(&self, file_id: FileId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::fts_remove_file(&mut conn, file_id).await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        scope: Option<&str>,
    ) -> Result<Vec<KeywordHit>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.rowid AS chunk_id, bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks ON chunks.id = chunks_fts.rowid
            JOIN files ON files.id = chunks.file_id
            WHERE chunks_fts MATCH ?3
              AND files.status != 'deleted'
              AND (?1 IS NULL OR files.path = ?1 OR substr(files.path, 1, length(?2)) = ?2)
            ORDER BY score, chunk_id
            LIMIT ?4
            "#,
        )
        .bind(scope)
        .bind(scope.map(scope_prefix))
        .bind(&fts_query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let score: f64 = row.try_get("score")?;
                Ok(KeywordHit {
                    chunk_id: row.try_get("chunk_id")?,
                    // bm25 is lower-is-better
                    score: -score,
                })
            })
            .collect()
    }
}
