//! # Circuit Breaker
//!
//! A three-state failure gate guarding egress calls, keyed per worker class
//! and optionally per destination host by whoever owns the breaker. The
//! breaker itself only tracks one destination's state; callers hold one
//! instance per key (see the server's egress module).

use crate::CIRCUIT_OPEN_MESSAGE;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub max_halfopen_reqs: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            max_halfopen_reqs: 1,
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    halfopen_successes: u32,
    last_transition: Instant,
}

/// Thread-safe circuit breaker implementing the state table in the
/// specification. A single [`Mutex`] is enough: the critical section is a
/// handful of integer comparisons, never a blocking or awaited call.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Returned by [`CircuitBreaker::try_acquire`] when a call may proceed; drop
/// it through [`Guard::on_success`] or [`Guard::on_failure`] to record the
/// outcome.
pub struct Guard<'a> {
    breaker: &'a CircuitBreaker,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                halfopen_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Attempts to admit one call. Returns `Err` with the spec-mandated
    /// message if the breaker is open and the reset timeout has not yet
    /// elapsed, without invoking the guarded function.
    pub fn try_acquire(&self) -> Result<Guard<'_>, &'static str> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {}
            CircuitState::Open => {
                if inner.last_transition.elapsed() >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.halfopen_successes = 0;
                } else {
                    return Err(CIRCUIT_OPEN_MESSAGE);
                }
            }
        }
        drop(inner);
        Ok(Guard { breaker: self })
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.halfopen_successes += 1;
                if inner.halfopen_successes >= self.config.max_halfopen_reqs {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.max_failures {
                    inner.state = CircuitState::Open;
                    inner.last_transition = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_transition = Instant::now();
            }
            CircuitState::Open => {}
        }
    }
}

impl Guard<'_> {
    pub fn on_success(self) {
        self.breaker.record_success();
    }

    pub fn on_failure(self) {
        self.breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            max_failures: 5,
            reset_timeout: Duration::from_millis(20),
            max_halfopen_reqs: 2,
        })
    }

    #[test]
    fn closed_stays_closed_after_successes() {
        let b = breaker();
        for _ in 0..10 {
            b.try_acquire().unwrap().on_success();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_max_failures() {
        let b = breaker();
        for _ in 0..5 {
            b.try_acquire().unwrap().on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_without_invoking_guarded_call_while_open() {
        let b = breaker();
        for _ in 0..5 {
            b.try_acquire().unwrap().on_failure();
        }
        let err = b.try_acquire().unwrap_err();
        assert_eq!(err, CIRCUIT_OPEN_MESSAGE);
    }

    #[test]
    fn half_open_recovers_to_closed_after_enough_successes() {
        let b = breaker();
        for _ in 0..5 {
            b.try_acquire().unwrap().on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        // First post-timeout attempt moves Open -> HalfOpen and is admitted.
        b.try_acquire().unwrap().on_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap().on_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let b = breaker();
        for _ in 0..5 {
            b.try_acquire().unwrap().on_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        b.try_acquire().unwrap().on_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
