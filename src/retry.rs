//! Retry and circuit-breaker primitives.
//!
//! These are the ambient error-handling utilities the source's error module
//! carries alongside the error taxonomy. The engine does not invoke them
//! internally — `getWithProtection`'s loader-error propagation is
//! unconditional — they exist for embedders who want to wrap a `loader`
//! closure with backoff and trip protection before handing it to the cache.

use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter-free, deterministic delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay never grows past this.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or `max_attempts` is exhausted, sleeping
    /// between attempts with exponential backoff.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, %e, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.backoff_multiplier)
                            .min(self.max_delay.as_secs_f64()),
                    );
                }
            }
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through normally.
    Closed,
    /// Calls are rejected without attempting the underlying operation.
    Open,
    /// A single trial call is allowed to decide whether to close again.
    HalfOpen,
}

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping from `Closed` to `Open`.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` required to close again.
    pub success_threshold: u32,
    /// How long the breaker stays `Open` before allowing a trial call.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// A simple closed/open/half-open circuit breaker. Not wired into the engine
/// automatically; pass a loader through [`CircuitBreaker::guard`] yourself.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<std::time::Instant>,
}

impl CircuitBreaker {
    /// Creates a breaker in the `Closed` state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    /// Current state, accounting for `open_timeout` elapsing since the trip.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.config.open_timeout {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// Records the outcome of a call made while the breaker allowed it.
    pub fn record(&mut self, succeeded: bool) {
        if succeeded {
            self.consecutive_failures = 0;
            if self.state == BreakerState::HalfOpen {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = BreakerState::Closed;
                    self.consecutive_successes = 0;
                }
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.state == BreakerState::HalfOpen
                || self.consecutive_failures >= self.config.failure_threshold
            {
                self.state = BreakerState::Open;
                self.opened_at = Some(std::time::Instant::now());
            }
        }
    }

    /// Runs `op` if the breaker currently allows it, recording the outcome.
    /// Returns `None` without invoking `op` when the breaker is `Open`.
    pub async fn guard<T, E, F, Fut>(&mut self, op: F) -> Option<std::result::Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
    {
        if self.state() == BreakerState::Open {
            return None;
        }
        let result = op().await;
        self.record(result.is_ok());
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record(false);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record(false);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn retry_policy_retries_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: std::result::Result<u32, &str> = policy
            .run(|| async {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
    }
}
