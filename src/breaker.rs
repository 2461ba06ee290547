//! [B] Circuit breaker — per-operation fault isolation with jittered
//! half-open probing.
//!
//! Grounded on `domain/error.rs`'s per-error `is_transient`/`is_permanent`
//! predicate idiom from the teacher, applied to an explicit state machine
//! since the teacher itself has no breaker (it retries via the `backoff`
//! crate instead). Jitter prevents synchronized thundering-herd retries
//! across clones (spec section 4.B).

use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::buffers::RingBuffer;
use crate::error::ArbiterError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A recorded state transition, kept in a bounded history for inspection.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: Instant,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    next_attempt: Option<Instant>,
    history: RingBuffer<StateChange>,
}

/// Configuration for a circuit breaker instance.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    /// Fraction of `reset_timeout` added as jitter, e.g. 0.2 = up to +20%.
    pub jitter: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// A per-arbiter circuit breaker. Cheaply cloneable (shares inner state).
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                next_attempt: None,
                history: RingBuffer::new(32),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn history(&self) -> Vec<StateChange> {
        self.inner.lock().history.all()
    }

    /// Run `op`, applying breaker semantics. If the breaker is open and
    /// `fallback` is provided, runs `fallback` instead of failing.
    pub async fn execute<F, Fb, T, E>(&self, op: F, fallback: Option<Fb>) -> Result<T, ArbiterError>
    where
        F: Future<Output = Result<T, E>>,
        Fb: Future<Output = Result<T, E>>,
    {
        let should_probe = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => true,
                BreakerState::Open => {
                    let now = Instant::now();
                    if inner.next_attempt.is_none_or(|t| now < t) {
                        false
                    } else {
                        self.transition(&mut inner, BreakerState::HalfOpen);
                        inner.half_open_successes = 0;
                        true
                    }
                }
                BreakerState::HalfOpen => true,
            }
        };

        if !should_probe {
            if let Some(fb) = fallback {
                return fb.await.map_err(|_| self.circuit_open_error());
            }
            return Err(self.circuit_open_error());
        }

        match op.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(_) => {
                self.on_failure();
                Err(self.circuit_open_error())
            }
        }
    }

    fn circuit_open_error(&self) -> ArbiterError {
        let next = self
            .inner
            .lock()
            .next_attempt
            .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as i64)
            .unwrap_or(0);
        ArbiterError::CircuitOpen {
            next_attempt_ms: next,
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open_with_jitter(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.open_with_jitter(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn open_with_jitter(&self, inner: &mut Inner) {
        self.transition(inner, BreakerState::Open);
        let jitter_ms = (self.config.reset_timeout.as_millis() as f64 * self.config.jitter).max(0.0);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms as u64).max(0));
        inner.next_attempt = Some(Instant::now() + self.config.reset_timeout + jitter);
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.history.add(StateChange {
            from,
            to,
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_breaker_resets_failure_counter_on_success() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        for _ in 0..2 {
            let _ = breaker
                .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                    async { Err::<(), ()>(()) },
                    None,
                )
                .await;
        }
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Ok::<(), ()>(()) },
                None,
            )
            .await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn threshold_failures_open_the_breaker() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            jitter: 0.0,
            ..Default::default()
        });
        for _ in 0..3 {
            let _ = breaker
                .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                    async { Err::<(), ()>(()) },
                    None,
                )
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_breaker_rejects_immediately_before_reset() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            jitter: 0.0,
            ..Default::default()
        });
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Err::<(), ()>(()) },
                None,
            )
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Ok::<(), ()>(()) },
                None,
            )
            .await;
        assert!(matches!(result, Err(ArbiterError::CircuitOpen { .. })));
        // op never ran because we short-circuited; state still open
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_success_threshold_closes_breaker() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(1),
            jitter: 0.0,
            ..Default::default()
        });
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Err::<(), ()>(()) },
                None,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        for _ in 0..2 {
            let _ = breaker
                .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                    async { Ok::<(), ()>(()) },
                    None,
                )
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_fresh_delay() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(1),
            jitter: 0.0,
            ..Default::default()
        });
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Err::<(), ()>(()) },
                None,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Err::<(), ()>(()) },
                None,
            )
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn fallback_runs_when_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            jitter: 0.0,
            ..Default::default()
        });
        let _ = breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                async { Err::<(), ()>(()) },
                None,
            )
            .await;

        let result = breaker
            .execute(async { Err::<i32, ()>(()) }, Some(async { Ok::<i32, ()>(7) }))
            .await;
        assert_eq!(result, Ok(7));
    }
}
