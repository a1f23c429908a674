//! Failure taxonomy for indexing and retrieval.
//!
//! Orchestration code returns `anyhow::Result` and wraps these typed errors; policy
//! points recover the category with [`error_kind`], which also classifies raw
//! `sqlx`, `std::io` and embedding errors that were propagated with `?`.

use crate::retrieval::indexing_pipeline::PipelineStage;
use quarry_embed::EmbedError;
use serde::Serialize;
use std::time::Duration;

/// Why a file's content could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ContentFailure {
    #[error("unsupported file type")]
    Unsupported,
    #[error("corrupt content: {0}")]
    Corrupt(String),
    #[error("unreadable: {0}")]
    Unreadable(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("embeddings incomplete: {embedded} of {total} chunks")]
    IncompleteEmbeddings { embedded: usize, total: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Retryable: timeouts, lock contention, interrupted reads
    #[error("transient I/O failure{}: {message}", context(.path, .stage))]
    TransientIo {
        path: Option<String>,
        stage: Option<PipelineStage>,
        message: String,
    },

    /// Unsupported or corrupt file; marked failed and not retried until it changes
    #[error("permanent content failure{}: {reason}", context(&Some(.path.clone()), .stage))]
    PermanentContent {
        path: String,
        stage: Option<PipelineStage>,
        reason: ContentFailure,
    },

    /// The embedding backend is unreachable or its circuit breaker is open
    #[error("embedding backend unavailable: {message}")]
    BackendUnavailable {
        retry_after: Option<Duration>,
        message: String,
    },

    /// The stores disagree, e.g. a chunk references a vector that does not exist
    #[error("consistency violation{}: {message}", context(.path, &None))]
    ConsistencyViolation {
        path: Option<String>,
        message: String,
    },

    /// Embedding model or dimension differs from what the stores were built with
    #[error("configuration mismatch: {message}")]
    ConfigurationMismatch { message: String },

    /// Disk full, corruption, or the database cannot be reached at all
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("invalid path {path}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("not found: {what}")]
    NotFound { what: String },
}

fn context(path: &Option<String>, stage: &Option<PipelineStage>) -> String {
    match (path, stage) {
        (Some(path), Some(stage)) => format!(" in {stage} for {path}"),
        (Some(path), None) => format!(" for {path}"),
        (None, Some(stage)) => format!(" in {stage}"),
        (None, None) => String::new(),
    }
}

/// Flat classification used by failure policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    PermanentContent,
    BackendUnavailable,
    ConsistencyViolation,
    ConfigurationMismatch,
    StoreUnavailable,
    InvalidInput,
    NotFound,
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::PermanentContent { .. } => ErrorKind::PermanentContent,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::ConsistencyViolation { .. } => ErrorKind::ConsistencyViolation,
            Self::ConfigurationMismatch { .. } => ErrorKind::ConfigurationMismatch,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::InvalidConfig { .. } | Self::InvalidQuery { .. } | Self::InvalidPath { .. } => {
                ErrorKind::InvalidInput
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            path: None,
            stage: None,
            message: message.into(),
        }
    }

    pub fn consistency(path: Option<String>, message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            path,
            message: message.into(),
        }
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::ConfigurationMismatch {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::BackendUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<EmbedError> for IndexError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::CircuitOpen { retry_after } => Self::BackendUnavailable {
                retry_after: Some(retry_after),
                message: "circuit breaker open".to_string(),
            },
            EmbedError::InvalidConfig { message } => Self::InvalidConfig { message },
            other if other.is_transient() => Self::BackendUnavailable {
                retry_after: None,
                message: other.to_string(),
            },
            EmbedError::Protocol { message } => Self::BackendUnavailable {
                retry_after: None,
                message,
            },
            other => Self::transient(other.to_string()),
        }
    }
}

/// Classify any error produced while indexing or searching.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(index_err) = cause.downcast_ref::<IndexError>() {
            return index_err.kind();
        }
        if let Some(embed_err) = cause.downcast_ref::<EmbedError>() {
            if embed_err.is_circuit_open() || embed_err.is_transient() {
                return ErrorKind::BackendUnavailable;
            }
        }
        if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
            return classify_sqlx(db_err);
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return classify_io(io_err);
        }
    }
    ErrorKind::TransientIo
}

// Primary SQLite result codes (the low byte of extended codes)
const SQLITE_IOERR: i64 = 10;
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_FULL: i64 = 13;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_NOTADB: i64 = 26;

pub(crate) fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorKind::TransientIo,
                Some(SQLITE_FULL) | Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB)
                | Some(SQLITE_IOERR) | Some(SQLITE_CANTOPEN) => ErrorKind::StoreUnavailable,
                _ => ErrorKind::ConsistencyViolation,
            }
        }
        sqlx::Error::PoolTimedOut => ErrorKind::TransientIo,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            ErrorKind::StoreUnavailable
        }
        _ => ErrorKind::TransientIo,
    }
}

fn classify_io(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::PermissionDenied | Io::NotFound | Io::InvalidData => ErrorKind::PermanentContent,
        Io::StorageFull => ErrorKind::StoreUnavailable,
        _ => ErrorKind::TransientIo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_anyhow_wrapping() {
        let err = anyhow::Error::new(IndexError::mismatch("dimension 768 != 512"))
            .context("opening vector store");
        assert_eq!(error_kind(&err), ErrorKind::ConfigurationMismatch);
    }

    #[test]
    fn test_embed_errors_map_to_backend_unavailable() {
        let open: IndexError = EmbedError::CircuitOpen {
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert_eq!(open.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(open.retry_after(), Some(Duration::from_secs(3)));

        let timeout: IndexError = EmbedError::timeout("30s").into();
        assert_eq!(timeout.kind(), ErrorKind::BackendUnavailable);

        let raw = anyhow::Error::new(EmbedError::Connection {
            message: "refused".into(),
        });
        assert_eq!(error_kind(&raw), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn test_io_errors_are_classified() {
        let denied = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_eq!(error_kind(&denied), ErrorKind::PermanentContent);

        let interrupted = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "eintr",
        ));
        assert_eq!(error_kind(&interrupted), ErrorKind::TransientIo);
    }

    #[test]
    fn test_messages_carry_path_and_stage() {
        let err = IndexError::PermanentContent {
            path: "/data/scan.pdf".to_string(),
            stage: Some(PipelineStage::Reading),
            reason: ContentFailure::Corrupt("bad xref table".to_string()),
        };
        let message = err.to_string();
        assert!(message.contains("/data/scan.pdf"));
        assert!(message.contains("reading"));
        assert!(message.contains("bad xref table"));
    }
}
