//! Circuit breaker for broker and state-store calls.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                                 │ now >= next_attempt
//!     │ success_threshold successes                     ▼ (checked on next call)
//!     └──────────────────────────────────────────── HALF_OPEN
//!                         any failure ──▶ OPEN (fresh reset_timeout)
//! ```
//!
//! Every state check and transition happens under one lock, so concurrent
//! callers observe a consistent state machine. Time comes from
//! [`tokio::time::Instant`] so tests can drive it with a paused clock.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls until the reset timeout elapses
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Hard timeout for a single call (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Why a protected call did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the operation
    #[error("circuit breaker '{name}' is open, retry in {}ms", .retry_in.as_millis())]
    Open { name: String, retry_in: Duration },

    /// The operation exceeded the call timeout
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The operation itself failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns true for the "breaker open" rejection, which callers must not
    /// treat as a downstream failure.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Remaining wait time for an open rejection.
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerStats {
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    failed_calls: AtomicU64,
}

/// Point-in-time view for health output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub retry_in_ms: Option<u64>,
    pub last_failure_at: Option<String>,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub failed_calls: u64,
}

/// A named circuit breaker. One instance per protected dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
                last_failure: None,
            }),
            stats: BreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` under the breaker with the configured call timeout.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);

        if let Err(retry_in) = self.try_acquire() {
            self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
            debug!(
                breaker = %self.name,
                retry_in_ms = retry_in.as_millis() as u64,
                "Call rejected, circuit open"
            );
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_in,
            });
        }

        let call_timeout = self.config.call_timeout();
        match tokio::time::timeout(call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(&e.to_string());
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure("timeout");
                Err(BreakerError::Timeout(call_timeout))
            }
        }
    }

    /// Let a call through, or return the remaining open time.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                let next_attempt = inner.next_attempt.unwrap_or(now);
                if now >= next_attempt {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "Circuit half-open, probing");
                    Ok(())
                } else {
                    Err(next_attempt - now)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    info!(breaker = %self.name, outcome = "success", "Circuit closed");
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, reason: &str) {
        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, reason);
                }
            }
            CircuitState::HalfOpen => self.trip(&mut inner, reason),
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerState, reason: &str) {
        let reset_timeout = self.config.reset_timeout();
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.next_attempt = Some(Instant::now() + reset_timeout);
        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            reason = %reason,
            retry_in_ms = reset_timeout.as_millis() as u64,
            "Circuit opened"
        );
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let retry_in_ms = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(next)) => {
                Some(next.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_in_ms,
            last_failure_at: inner
                .last_failure
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            total_calls: self.stats.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.stats.rejected_calls.load(Ordering::Relaxed),
            failed_calls: self.stats.failed_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                reset_timeout_ms: 1_000,
                call_timeout_ms: 500,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.execute(|| async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.execute(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exact_threshold() {
        let b = breaker(5, 2);
        for _ in 0..4 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        let rejected = succeed(&b).await.unwrap_err();
        assert!(rejected.is_open());
        assert!(rejected.retry_in().unwrap() <= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(5, 2);
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 0);

        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let b = breaker(1, 2);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_window() {
        let b = breaker(1, 2);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(succeed(&b).await.unwrap_err().is_open());
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let b = breaker(1, 1);
        let result = b
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_counts() {
        let b = breaker(1, 1);
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.rejected_calls, 1);
        assert_eq!(snap.failed_calls, 1);
        assert!(snap.retry_in_ms.is_some());
        assert!(snap.last_failure_at.is_some());
    }
}
