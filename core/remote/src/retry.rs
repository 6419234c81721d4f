//! Retry strategy with exponential backoff for transient errors.

use reqwest::Method;
use std::time::Duration;

use tillsync_common::Error;

/// Write requests are only retried on these statuses.
const RETRYABLE_WRITE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth), before jitter.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_jitter: Duration::from_millis(500),
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter bound. Zero disables jitter.
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Calculate delay after the given (zero-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let jitter = self.max_jitter.as_millis() as f64 * rand::random::<f64>();

        Duration::from_millis((capped_delay + jitter) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Methods that never change server state.
pub fn is_read_only(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Whether a failed call may be attempted again.
///
/// Reads retry on any transient failure. Writes retry only on the statuses
/// that guarantee the server did not apply them, or asks for a retry.
pub fn should_retry(method: &Method, err: &Error) -> bool {
    match err {
        Error::CircuitOpen => false,
        Error::Network { blocked: true, .. } => false,
        _ if is_read_only(method) => err.is_transient(),
        _ => err
            .status()
            .is_some_and(|status| RETRYABLE_WRITE_STATUSES.contains(&status)),
    }
}
