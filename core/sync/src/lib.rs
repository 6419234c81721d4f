//! TillSync sync core
//!
//! Replays the offline mutation queue against the backend and ships the
//! append-only POS event log:
//! - Ordered, single-flight draining with per-item backoff
//! - Conflict detection and resolution (operator or stored preference)
//! - Idempotent event delivery keyed by event id
//! - Background scheduling on interval, demand and reconnect

pub mod config;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod notify;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::{EventLogConfig, SyncConfig};
pub use conflict::{ConflictInfo, ConflictResolution, ConflictStrategy, PREFERENCE_KEY};
pub use engine::SyncEngine;
pub use events::{EventLog, EventSyncSummary};
pub use notify::{RunOutcome, SkipReason, SyncEvent, SyncFailure, SyncSummary};
pub use scheduler::{run_cycle, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use state::{EngineState, SyncStats};
