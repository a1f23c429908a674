//! Configuration for the embedding gateway and backends

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for transient backend failures.
///
/// The delay before attempt `n + 1` is `initial_backoff_ms * 2^(n - 1)`, capped at
/// `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per backend call, including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given (1-based) failed attempt
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures within `failure_window_ms` that open the breaker
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    /// How long the breaker stays open before allowing a probe
    pub cooldown_ms: u64,
    /// Successful probes needed in half-open state to close again
    pub success_threshold: u32,
    /// Probes allowed in flight while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
            success_threshold: 1,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Gateway-wide batching, concurrency and timeout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum texts per backend call
    pub batch_size: usize,
    /// Maximum backend calls in flight across the whole process
    pub max_concurrent: usize,
    /// Per-call timeout
    pub call_timeout_ms: u64,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrent: 4,
            call_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Set the batch size (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the global cap on in-flight backend calls (builder style)
    pub fn with_max_concurrent(self, max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..self
        }
    }

    /// Set the per-call timeout (builder style)
    pub fn with_call_timeout(self, timeout: Duration) -> Self {
        Self {
            call_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    /// Replace the retry policy (builder style)
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        Self { retry, ..self }
    }

    /// Replace the breaker thresholds (builder style)
    pub fn with_breaker(self, breaker: CircuitBreakerConfig) -> Self {
        Self { breaker, ..self }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(EmbedError::invalid_config(
                "max_concurrent must be at least 1",
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(EmbedError::invalid_config("call_timeout_ms must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(EmbedError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.breaker.failure_threshold == 0
            || self.breaker.success_threshold == 0
            || self.breaker.half_open_max_probes == 0
        {
            return Err(EmbedError::invalid_config(
                "breaker thresholds and probe count must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Connection settings for an Ollama-compatible embedding service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub model: String,
    pub model_version: String,
    pub dimension: usize,
    /// Transport-level timeout; the gateway applies its own per-call timeout on top
    pub request_timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            model_version: "latest".to_string(),
            dimension: 768,
            request_timeout_ms: 60_000,
        }
    }
}

impl HttpBackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(retry.backoff_after(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_after(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_after(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_after(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_after(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(GatewayConfig::default().with_batch_size(0).validate().is_err());
        assert!(
            GatewayConfig::default()
                .with_max_concurrent(0)
                .validate()
                .is_err()
        );
        let breaker = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(GatewayConfig::default().with_breaker(breaker).validate().is_err());
    }
}
