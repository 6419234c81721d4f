//! Process-wide circuit breaker.
//!
//! Shared by every caller of the resilient client. All transitions use atomic
//! operations, so concurrent callers never observe a torn state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tillsync_common::{Clock, Error, Result};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Requests flow normally.
    #[default]
    Closed,
    /// Requests fail fast until the cooldown expires.
    Open,
    /// A single trial request decides between closing and reopening.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Permission to make one attempt, handed back with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Permit {
    Normal,
    /// The single half-open probe.
    Trial,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since the epoch at which the breaker last opened.
    opened_at: AtomicI64,
    trial_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicI64::new(0),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ask for permission to make an attempt.
    ///
    /// # Errors
    /// - `CircuitOpen` while the cooldown runs, or while another caller holds
    ///   the half-open trial
    pub fn try_acquire(&self) -> Result<Permit> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(Permit::Normal),
                CircuitState::HalfOpen => {
                    return if self.take_trial() {
                        Ok(Permit::Trial)
                    } else {
                        Err(Error::CircuitOpen)
                    };
                }
                CircuitState::Open => {
                    if !self.cooldown_expired() {
                        return Err(Error::CircuitOpen);
                    }
                    if !self.take_trial() {
                        return Err(Error::CircuitOpen);
                    }
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        info!("Circuit breaker cooldown expired, probing server");
                        return Ok(Permit::Trial);
                    }
                    // State moved under us; give the trial back and look again.
                    self.trial_in_flight.store(false, Ordering::Release);
                }
            }
        }
    }

    /// A 2xx response: close and reset.
    pub fn record_success(&self, permit: Permit) {
        self.consecutive_failures.store(0, Ordering::Release);
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if permit == Permit::Trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
        if previous != CLOSED {
            info!("Circuit breaker closed");
        }
    }

    /// A 5xx response or a timeout.
    pub fn record_failure(&self, permit: Permit) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match permit {
            Permit::Trial => {
                self.opened_at.store(self.now_ms(), Ordering::Release);
                self.state.store(OPEN, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                warn!("Circuit breaker trial failed, reopening");
            }
            Permit::Normal => {
                debug!("Circuit breaker failure {}/{}", failures, self.config.failure_threshold);
                if failures >= self.config.failure_threshold
                    && self.state.load(Ordering::Acquire) == CLOSED
                {
                    // opened_at must be visible before the state flips.
                    self.opened_at.store(self.now_ms(), Ordering::Release);
                    if self
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(
                            "Circuit breaker opened after {} consecutive failures",
                            failures
                        );
                    }
                }
            }
        }
    }

    /// An outcome that says nothing about server health (e.g. a 4xx).
    pub fn record_neutral(&self, permit: Permit) {
        if permit == Permit::Trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    fn take_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cooldown_expired(&self) -> bool {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        let cooldown = self.config.cooldown.as_millis() as i64;
        self.now_ms().saturating_sub(opened_at) >= cooldown
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_common::ManualClock;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
        (breaker, clock)
    }

    fn fail(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let (breaker, _) = breaker();
        fail(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_count() {
        let (breaker, _) = breaker();
        fail(&breaker, 4);
        breaker.record_success(breaker.try_acquire().unwrap());
        fail(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let (breaker, clock) = breaker();
        fail(&breaker, 5);

        clock.advance(chrono::Duration::seconds(29));
        assert!(breaker.try_acquire().is_err());

        clock.advance(chrono::Duration::seconds(1));
        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial, Permit::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time.
        assert!(breaker.try_acquire().is_err());

        breaker.record_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire().unwrap(), Permit::Normal);
    }

    #[test]
    fn test_failed_trial_restarts_cooldown() {
        let (breaker, clock) = breaker();
        fail(&breaker, 5);
        clock.advance(chrono::Duration::seconds(30));

        let trial = breaker.try_acquire().unwrap();
        breaker.record_failure(trial);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(chrono::Duration::seconds(10));
        assert!(breaker.try_acquire().is_err());
        clock.advance(chrono::Duration::seconds(20));
        assert_eq!(breaker.try_acquire().unwrap(), Permit::Trial);
    }

    #[test]
    fn test_neutral_outcome_releases_trial() {
        let (breaker, clock) = breaker();
        fail(&breaker, 5);
        clock.advance(chrono::Duration::seconds(30));

        let trial = breaker.try_acquire().unwrap();
        breaker.record_neutral(trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire().unwrap(), Permit::Trial);
    }
}
