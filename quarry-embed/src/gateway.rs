//! Resilient front door to an [`EmbeddingBackend`].
//!
//! The gateway is the only component that talks to the backend. For every call it:
//!
//! 1. splits the input into batches of at most `batch_size` texts,
//! 2. asks the [`CircuitBreaker`] for permission (failing fast while it is open),
//! 3. waits for one of `max_concurrent` global permits,
//! 4. enforces the per-call timeout,
//! 5. retries transient failures with exponential backoff, never permanent ones,
//! 6. validates, L2-normalizes and converts each vector to `f16`.
//!
//! Per-item failures inside a successful call stay per-item. A batch rejected as
//! malformed marks its own items as failed without failing the other batches. Anything
//! else (breaker open, retries exhausted) fails the whole `embed` call so the caller can
//! defer the work.

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::GatewayConfig;
use crate::error::{EmbedError, ItemFailure, Result};
use crate::provider::{EmbeddingBackend, EmbeddingResult, ItemResult, ModelInfo, RawItem};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use half::f16;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Counters and breaker state, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub backend: String,
    pub model_id: String,
    pub breaker: BreakerSnapshot,
    pub calls: u64,
    pub failed_calls: u64,
    pub rejected_fast: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_fast: AtomicU64,
}

pub struct EmbeddingGateway {
    backend: Arc<dyn EmbeddingBackend>,
    config: GatewayConfig,
    breaker: CircuitBreaker,
    permits: Semaphore,
    counters: Counters,
}

impl std::fmt::Debug for EmbeddingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGateway")
            .field("backend", &self.backend.backend_name())
            .field("model", self.backend.model())
            .field("config", &self.config)
            .finish()
    }
}

impl EmbeddingGateway {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            permits: Semaphore::new(config.max_concurrent),
            backend,
            config,
            counters: Counters::default(),
        })
    }

    pub fn model(&self) -> &ModelInfo {
        self.backend.model()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Embed `texts`, returning one entry per input in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let dimension = self.model().dimension;
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(Vec::new(), dimension));
        }

        let calls: Vec<BoxFuture<'_, (usize, Result<Vec<ItemResult>>)>> = texts
            .chunks(self.config.batch_size)
            .map(|batch| -> BoxFuture<'_, _> {
                Box::pin(async move { (batch.len(), self.call_with_policy(batch).await) })
            })
            .collect();
        let mut batches = stream::iter(calls).buffered(self.config.max_concurrent);

        let mut items = Vec::with_capacity(texts.len());
        while let Some((batch_len, outcome)) = batches.next().await {
            match outcome {
                Ok(batch_items) => items.extend(batch_items),
                Err(err) if err.is_input_rejection() => {
                    warn!("Embedding batch of {} rejected: {}", batch_len, err);
                    let reason = err.to_string();
                    items.extend(
                        std::iter::repeat_with(|| Err(ItemFailure::Rejected(reason.clone())))
                            .take(batch_len),
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(EmbeddingResult::new(items, dimension))
    }

    /// Embed a single query text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed(&[text.to_string()]).await?;
        match result.items.into_iter().next() {
            Some(Ok(vector)) => Ok(vector),
            Some(Err(failure)) => Err(EmbedError::MalformedInput {
                message: failure.to_string(),
            }),
            None => Err(EmbedError::protocol("backend returned no embedding")),
        }
    }

    pub fn health(&self) -> GatewayHealth {
        GatewayHealth {
            backend: self.backend.backend_name().to_string(),
            model_id: self.model().model_id(),
            breaker: self.breaker.snapshot(),
            calls: self.counters.calls.load(Ordering::Relaxed),
            failed_calls: self.counters.failed_calls.load(Ordering::Relaxed),
            rejected_fast: self.counters.rejected_fast.load(Ordering::Relaxed),
        }
    }

    async fn call_with_policy(&self, batch: &[String]) -> Result<Vec<ItemResult>> {
        let max_attempts = self.config.retry.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let admission = match self.breaker.try_acquire() {
                Ok(admission) => admission,
                Err(err) => {
                    self.counters.rejected_fast.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            };

            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| EmbedError::External { source: e.into() })?;
                self.counters.calls.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(
                    self.config.call_timeout(),
                    self.backend.embed_batch(batch),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EmbedError::timeout(format!(
                        "no response within {:?}",
                        self.config.call_timeout()
                    ))),
                }
            };

            let outcome = outcome.and_then(|items| {
                if items.len() == batch.len() {
                    Ok(items)
                } else {
                    Err(EmbedError::protocol(format!(
                        "requested {} embeddings, received {}",
                        batch.len(),
                        items.len()
                    )))
                }
            });

            match outcome {
                Ok(items) => {
                    admission.success();
                    return Ok(items.into_iter().map(|item| self.finish(item)).collect());
                }
                Err(err) if err.is_transient() => {
                    self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                    admission.failure();
                    if attempt >= max_attempts {
                        warn!(
                            "Embedding call failed after {} attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }
                    let delay = self.config.retry.backoff_after(attempt);
                    debug!(
                        "Transient embedding failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt, max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                    // The backend answered, so it is healthy even if the input was not
                    admission.success();
                    return Err(err);
                }
            }
        }
    }

    fn finish(&self, item: RawItem) -> ItemResult {
        let vector = item?;
        let expected = self.model().dimension;
        if vector.is_empty() {
            return Err(ItemFailure::Empty);
        }
        if vector.len() != expected {
            return Err(ItemFailure::Dimension {
                expected,
                actual: vector.len(),
            });
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return Err(ItemFailure::Degenerate);
        }
        Ok(vector.iter().map(|v| f16::from_f32(v / norm)).collect())
    }
}
