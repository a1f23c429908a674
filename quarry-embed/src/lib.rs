//! # quarry-embed
//!
//! The embedding side of quarry: a narrow backend contract plus the gateway that makes
//! calling it safe.
//!
//! The backend itself (a local Ollama-style service, a test double, anything else that
//! maps text to a fixed-length vector) is a black box behind [`EmbeddingBackend`]. All
//! callers go through [`EmbeddingGateway`], which adds batching, a global concurrency
//! cap, per-call timeouts, bounded retry with exponential backoff for transient
//! failures, and a circuit breaker that stops hammering a backend that is down.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_embed::{EmbeddingGateway, GatewayConfig, HttpBackendConfig, HttpEmbeddingBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backend = HttpEmbeddingBackend::new(HttpBackendConfig::default())?;
//! let gateway = EmbeddingGateway::new(Arc::new(backend), GatewayConfig::default())?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = gateway.embed(&texts).await?;
//! println!("{} of {} texts embedded", result.succeeded(), result.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`provider`]: backend trait, model identity, HTTP backend
//! - [`gateway`]: batching, retry and concurrency policy
//! - [`circuit_breaker`]: closed / open / half-open state machine
//! - [`mock`]: deterministic backend with failure injection
//! - [`config`]: serde-friendly settings
//! - [`error`]: error classification
//!
//! ## Precision
//!
//! Vectors leave the gateway L2-normalized and stored as half-precision (`f16`), which
//! halves storage while keeping cosine ranking stable.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mock;
pub mod provider;

// Re-export main types for easy access
pub use circuit_breaker::{BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::{CircuitBreakerConfig, GatewayConfig, HttpBackendConfig, RetryConfig};
pub use error::{EmbedError, ItemFailure, Result};
pub use gateway::{EmbeddingGateway, GatewayHealth};
pub use mock::{MockEmbeddingBackend, MockFailure};
pub use provider::{
    EmbeddingBackend, EmbeddingResult, HttpEmbeddingBackend, ItemResult, ModelInfo, RawItem,
};
