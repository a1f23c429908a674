//! Closed / open / half-open guard around the embedding backend.
//!
//! ```text
//!            failures >= threshold within window
//!   Closed ────────────────────────────────────────► Open
//!     ▲                                               │ cooldown elapsed
//!     │ success_threshold probes succeed              ▼
//!     └──────────────────────────────────────────  HalfOpen ──► Open (probe fails)
//! ```
//!
//! The breaker only tracks outcomes; the gateway decides which errors count as failures.

use crate::config::CircuitBreakerConfig;
use crate::error::{EmbedError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// Lower bound on the wait reported while a half-open probe is outstanding
const MIN_PROBE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub recent_failures: usize,
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    probes_in_flight: u32,
    times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                probes_in_flight: 0,
                times_opened: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission to call the backend.
    ///
    /// Fails with [`EmbedError::CircuitOpen`] while open, or while half-open with all
    /// probe slots taken. Moves an open breaker to half-open once the cooldown elapsed.
    /// The returned permit reports the call's outcome; dropping it unreported (the call
    /// was cancelled or timed out from outside) frees its probe slot.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, None)),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown() {
                    tracing::info!("Circuit breaker half-open, sending probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probes_in_flight = 1;
                    Ok(BreakerPermit::new(self, Some(inner.times_opened)))
                } else {
                    Err(EmbedError::CircuitOpen {
                        retry_after: self.config.cooldown() - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    Ok(BreakerPermit::new(self, Some(inner.times_opened)))
                } else {
                    // Never zero, so deferred callers do not spin while a probe runs
                    Err(EmbedError::CircuitOpen {
                        retry_after: self.config.cooldown().max(MIN_PROBE_WAIT),
                    })
                }
            }
        }
    }

    /// Free a probe slot whose call ended without an outcome. Slots from an earlier
    /// half-open period are ignored.
    fn release_probe(&self, opened: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && inner.times_opened == opened {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            tracing::debug!("Circuit breaker probe abandoned, slot released");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failures.clear(),
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    tracing::info!("Circuit breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    inner.probes_in_flight = 0;
                }
            }
            // A call admitted before the breaker opened finished late
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => {
                let window = self.config.failure_window();
                inner.failures.push_back(now);
                while let Some(&oldest) = inner.failures.front() {
                    if now.duration_since(oldest) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    tracing::warn!(
                        "Circuit breaker opened after {} failures",
                        inner.failures.len()
                    );
                    Self::open(&mut inner, now);
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!("Circuit breaker probe failed, reopening");
                Self::open(&mut inner, now);
            }
            BreakerState::Open => {}
        }
    }

    fn open(inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.probes_in_flight = 0;
        inner.times_opened += 1;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            recent_failures: inner.failures.len(),
            times_opened: inner.times_opened,
        }
    }
}

/// Admission to call the backend, handed out by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Self::success) or [`failure`](Self::failure).
/// A permit dropped without either is treated as an abandoned call: it counts as
/// neither, but a half-open probe slot it held is released.
#[derive(Debug)]
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// `times_opened` at admission, when this permit holds a probe slot
    probe: Option<u64>,
    reported: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: Option<u64>) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        if let Some(opened) = self.probe {
            self.breaker.release_probe(opened);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 60_000,
            cooldown_ms,
            success_threshold: 1,
            half_open_max_probes: 1,
        })
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = breaker(3, 60_000);

        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().unwrap_err().is_circuit_open());
        assert_eq!(breaker.snapshot().times_opened, 1);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, 60_000);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window_ms: 20,
            ..Default::default()
        });

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Only one probe at a time, and the wait reported is never zero
        match breaker.try_acquire() {
            Err(EmbedError::CircuitOpen { retry_after }) => assert!(retry_after >= MIN_PROBE_WAIT),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        probe.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().times_opened, 2);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_abandoned_permit_frees_its_slot() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));

        let probe = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err());
        drop(probe);

        // Still half-open, but the next caller may probe
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.try_acquire().unwrap().success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_stale_permit_does_not_release_a_newer_slot() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        let stale = breaker.try_acquire().unwrap();

        // Another caller's failure reopens; the next half-open period starts
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        let current = breaker.try_acquire().unwrap();

        drop(stale);
        assert!(breaker.try_acquire().is_err());
        current.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
