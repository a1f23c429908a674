//! Deterministic in-process backend for tests and offline development.
//!
//! Vectors are built by feature hashing lowercase alphanumeric tokens, so texts that
//! share words end up close under cosine similarity. Failures can be injected per call.

use crate::error::{EmbedError, ItemFailure, Result};
use crate::provider::{EmbeddingBackend, ModelInfo, RawItem};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Failure modes the mock can simulate for a whole call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection refused
    Unavailable,
    /// Backend hangs past the caller's timeout
    Hang,
    /// Request rejected as malformed
    Malformed,
}

#[derive(Debug, Default)]
struct MockState {
    scripted: VecDeque<MockFailure>,
    persistent: Option<MockFailure>,
    reject_marker: Option<String>,
    delay: Option<Duration>,
}

#[derive(Debug)]
pub struct MockEmbeddingBackend {
    model: ModelInfo,
    calls: AtomicUsize,
    texts_embedded: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockEmbeddingBackend {
    pub fn new(dimension: usize) -> Self {
        Self::with_model(ModelInfo::new("mock-hash", "1", dimension))
    }

    pub fn with_model(model: ModelInfo) -> Self {
        Self {
            model,
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `times` calls with `failure`, then behave normally.
    pub fn fail_next(&self, times: usize, failure: MockFailure) {
        let mut state = self.state();
        state.scripted.extend(std::iter::repeat_n(failure, times));
    }

    /// Fail every call until cleared with `None`.
    pub fn set_failure(&self, failure: Option<MockFailure>) {
        self.state().persistent = failure;
    }

    /// Report a per-item failure for any text containing `marker`.
    pub fn reject_items_containing(&self, marker: impl Into<String>) {
        self.state().reject_marker = Some(marker.into());
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Backend calls made so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts that were successfully turned into vectors.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// The vector this backend produces for `text` (before gateway normalization).
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let dimension = self.model.dimension;
        let mut vector = vec![0.0f32; dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = FnvHasher::default();
            hasher.write(token.to_lowercase().as_bytes());
            let hash = hasher.finish();
            let index = (hash % dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<RawItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (failure, reject_marker, delay) = {
            let mut state = self.state();
            let failure = state.scripted.pop_front().or(state.persistent);
            (failure, state.reject_marker.clone(), state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(MockFailure::Unavailable) => {
                return Err(EmbedError::Connection {
                    message: "connection refused (mock)".to_string(),
                });
            }
            Some(MockFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Some(MockFailure::Malformed) => {
                return Err(EmbedError::MalformedInput {
                    message: "malformed request (mock)".to_string(),
                });
            }
            None => {}
        }

        let items: Vec<RawItem> = texts
            .iter()
            .map(|text| match &reject_marker {
                Some(marker) if text.contains(marker.as_str()) => {
                    Err(ItemFailure::Rejected(format!("text contains {marker}")))
                }
                _ => Ok(self.vector_for(text)),
            })
            .collect();

        let ok = items.iter().filter(|item| item.is_ok()).count();
        self.texts_embedded.fetch_add(ok, Ordering::SeqCst);
        Ok(items)
    }

    fn model(&self) -> &ModelInfo {
        &self.model
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vectors_are_deterministic() {
        let backend = MockEmbeddingBackend::new(32);
        let a = backend.vector_for("Hybrid search with rank fusion");
        let b = backend.vector_for("hybrid SEARCH with rank fusion");

        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_recovery() {
        let backend = MockEmbeddingBackend::new(8);
        backend.fail_next(1, MockFailure::Unavailable);

        let texts = vec!["one".to_string()];
        assert!(backend.embed_batch(&texts).await.is_err());
        assert!(backend.embed_batch(&texts).await.is_ok());
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.texts_embedded(), 1);
    }

    #[tokio::test]
    async fn test_rejects_marked_items_only() {
        let backend = MockEmbeddingBackend::new(8);
        backend.reject_items_containing("POISON");

        let items = backend
            .embed_batch(&["fine".to_string(), "has POISON".to_string()])
            .await
            .unwrap();

        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ItemFailure::Rejected(_))));
    }
}
