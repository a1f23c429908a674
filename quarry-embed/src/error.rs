//! Error types for the embedding gateway

use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Everything that can go wrong when asking the backend for vectors.
///
/// Variants are grouped by how the gateway reacts to them:
///
/// - **Transient** ([`Timeout`](Self::Timeout), [`Connection`](Self::Connection),
///   HTTP 429/5xx): retried with backoff and counted against the circuit breaker.
/// - **Permanent** ([`MalformedInput`](Self::MalformedInput), other HTTP 4xx,
///   [`Protocol`](Self::Protocol)): returned immediately, never retried.
/// - **Fail-fast** ([`CircuitOpen`](Self::CircuitOpen)): the backend was not invoked.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// The backend did not answer within the per-call timeout
    #[error("Embedding backend timed out: {message}")]
    Timeout { message: String },

    /// The backend could not be reached (connection refused, reset, DNS)
    #[error("Could not connect to embedding backend: {message}")]
    Connection { message: String },

    /// The backend answered with a non-success status
    #[error("Embedding backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The backend rejected the request payload itself
    #[error("Embedding backend rejected input: {message}")]
    MalformedInput { message: String },

    /// The backend answered, but not with what the contract promises
    #[error("Embedding backend protocol error: {message}")]
    Protocol { message: String },

    /// The circuit breaker is open; no call was made
    #[error("Embedding backend unavailable (circuit open), retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Error when gateway configuration is invalid
    #[error("Invalid gateway configuration: {message}")]
    InvalidConfig { message: String },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Whether the failure is worth retrying and should count against the breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the failure is tied to the submitted texts rather than the backend's health.
    pub fn is_input_rejection(&self) -> bool {
        match self {
            Self::MalformedInput { .. } => true,
            Self::Http { status, .. } => (400..500).contains(status) && *status != 429,
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_request() {
            Self::Connection {
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            Self::Protocol {
                message: err.to_string(),
            }
        } else {
            Self::External { source: err.into() }
        }
    }
}

/// Why a single text in an otherwise successful batch produced no vector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemFailure {
    #[error("backend returned an empty embedding")]
    Empty,

    #[error("embedding has dimension {actual}, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding contains non-finite values or has zero norm")]
    Degenerate,

    #[error("input rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EmbedError::timeout("30s").is_transient());
        assert!(
            EmbedError::Connection {
                message: "refused".into()
            }
            .is_transient()
        );
        assert!(
            EmbedError::Http {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            EmbedError::Http {
                status: 429,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !EmbedError::MalformedInput {
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(
            !EmbedError::CircuitOpen {
                retry_after: Duration::from_secs(1)
            }
            .is_transient()
        );
    }

    #[test]
    fn test_input_rejection_classification() {
        assert!(
            EmbedError::Http {
                status: 400,
                message: String::new()
            }
            .is_input_rejection()
        );
        assert!(
            !EmbedError::Http {
                status: 429,
                message: String::new()
            }
            .is_input_rejection()
        );
        assert!(!EmbedError::timeout("slow").is_input_rejection());
    }
}
