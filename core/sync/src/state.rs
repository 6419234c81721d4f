//! Engine state machine and running counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use tillsync_common::QueueId;

/// Lifecycle of the mutation sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// No run in progress; triggers start a run.
    #[default]
    Idle,
    /// Draining the queue. Further triggers are ignored.
    Running,
    /// Suspended on a conflict that only `resolve_conflict` or
    /// `reject_conflict` can clear.
    AwaitingConflictResolution(QueueId),
}

impl EngineState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, EngineState::Idle)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::AwaitingConflictResolution(id) => {
                write!(f, "awaiting conflict resolution for #{}", id)
            }
        }
    }
}

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub runs: u64,
    pub items_synced: u64,
    pub items_failed: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStats {
    pub fn mark_run_started(&mut self, at: DateTime<Utc>) {
        self.runs += 1;
        self.last_run_at = Some(at);
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.items_synced += 1;
        self.last_success_at = Some(at);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.items_failed += 1;
        self.last_error = Some(error.into());
    }

    pub fn mark_conflict_detected(&mut self) {
        self.conflicts_detected += 1;
    }

    pub fn mark_conflict_resolved(&mut self, at: DateTime<Utc>) {
        self.conflicts_resolved += 1;
        self.last_success_at = Some(at);
    }
}
