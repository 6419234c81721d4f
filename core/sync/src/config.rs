//! Sync engine and event log configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the mutation sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// An item fails terminally once its attempts exceed this ceiling.
    pub max_attempts_before_failure: u32,
    /// Base of the pause after a failed item: `base * 2^attempts`.
    pub backoff_base_ms: u64,
    /// Period of the background scheduler.
    pub sync_interval_secs: u64,
    /// Capacity of the notification channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Pause after an item's `attempts`-th failure.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        self.backoff_base()
            .saturating_mul(1u32 << attempts.min(16))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts_before_failure: 5,
            backoff_base_ms: 1_000,
            sync_interval_secs: 30,
            event_capacity: 64,
        }
    }
}

/// Configuration for the idempotent event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Synced events older than this are purged.
    pub retention_hours: i64,
    /// Error codes that mark an event as permanently rejected.
    pub rejection_codes: Vec<String>,
}

impl EventLogConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            rejection_codes: vec!["INSUFFICIENT_STOCK".to_string(), "VOIDED".to_string()],
        }
    }
}
