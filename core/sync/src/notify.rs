//! Typed notifications published by the sync engine.

use serde::Serialize;
use std::time::Duration;

use tillsync_common::QueueId;

use crate::conflict::ConflictInfo;

/// Why a run did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
    AwaitingConflict(QueueId),
}

/// What went wrong, at run or item scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncFailure {
    /// The whole run stopped early, e.g. the service is degraded.
    Run { reason: String },
    /// One item exhausted its attempts.
    Item {
        queue_id: QueueId,
        entity_id: String,
        error: String,
    },
}

/// Totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    /// Items looked at, in order.
    pub processed: usize,
    pub synced: usize,
    pub conflicts_resolved: usize,
    pub failed: usize,
    /// Items left `Pending` for a later run.
    pub deferred: usize,
    /// The run stopped before reaching the end of the queue.
    pub halted: bool,
    pub duration: Duration,
}

/// Result of a call to `SyncEngine::run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunOutcome {
    Completed(SyncSummary),
    /// Stopped on a conflict that needs an operator decision.
    Suspended {
        queue_id: QueueId,
        summary: SyncSummary,
    },
    Skipped(SkipReason),
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            RunOutcome::Completed(summary) | RunOutcome::Suspended { summary, .. } => Some(summary),
            RunOutcome::Skipped(_) => None,
        }
    }
}

/// Published over a broadcast channel; see `SyncEngine::subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    Started { total: usize },
    Progress {
        percent: u8,
        current: usize,
        total: usize,
    },
    Completed { summary: SyncSummary },
    Failed(SyncFailure),
    /// A real conflict was found; the engine waits for a decision.
    Conflict(ConflictInfo),
    Skipped { reason: SkipReason },
}

/// Whole-number percentage of `current` over `total`.
pub(crate) fn percent(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((current.min(total) * 100) / total) as u8
}
