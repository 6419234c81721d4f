//! Network client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::retry::RetryConfig;

/// Settings for the resilient client and its HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the POS API, e.g. `https://pos.example.com/api/`.
    pub base_url: String,
    pub user_agent: String,
    /// Per-attempt deadline.
    pub timeout_ms: u64,
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added to every backoff.
    pub max_jitter_ms: u64,
    /// Consecutive server failures that open the breaker.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_jitter(Duration::from_millis(self.max_jitter_ms))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/".to_string(),
            user_agent: format!("tillsync/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: 25_000,
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_jitter_ms: 500,
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}
