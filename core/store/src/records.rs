//! Records persisted by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tillsync_common::{
    EntityPayload, EntitySyncStatus, EntityType, EventId, EventStatus, EventType, MutationStatus,
    Operation, QueueId,
};

/// A pending change to a remotely stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueItem {
    pub id: QueueId,
    pub operation: Operation,
    /// Full snapshot of the entity at enqueue time.
    pub entity: EntityPayload,
    pub timestamp: DateTime<Utc>,
    /// Failed send attempts so far.
    pub attempts: u32,
    pub status: MutationStatus,
    pub last_error: Option<String>,
}

impl MutationQueueItem {
    pub fn entity_type(&self) -> EntityType {
        self.entity.entity_type()
    }

    pub fn entity_id(&self) -> &str {
        self.entity.entity_id()
    }
}

/// A mutation about to be enqueued; the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub operation: Operation,
    pub entity: EntityPayload,
    pub timestamp: DateTime<Utc>,
}

/// Partial update of a queue item. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationPatch {
    pub status: Option<MutationStatus>,
    pub attempts: Option<u32>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
}

impl MutationPatch {
    pub fn status(status: MutationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }
}

/// Append-only business fact, e.g. a completed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosEvent {
    /// Idempotency key, unique for the lifetime of the event.
    pub event_id: EventId,
    pub event_type: EventType,
    /// Request body replayed verbatim to the server.
    pub payload: Value,
    pub status: EventStatus,
    /// Remote transaction id, set on success.
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PosEvent {
    /// Create a new pending event with a fresh id.
    pub fn new(event_type: EventType, payload: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::generate(),
            event_type,
            payload,
            status: EventStatus::Pending,
            transaction_id: None,
            created_at,
            last_error: None,
        }
    }
}

/// Partial update of an event. Only status-related fields are mutable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub status: Option<EventStatus>,
    pub transaction_id: Option<String>,
    pub last_error: Option<Option<String>>,
}

impl EventPatch {
    pub fn synced(transaction_id: Option<String>) -> Self {
        Self {
            status: Some(EventStatus::Synced),
            transaction_id,
            last_error: Some(None),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(EventStatus::Failed),
            transaction_id: None,
            last_error: Some(Some(error.into())),
        }
    }

    pub fn voided() -> Self {
        Self {
            status: Some(EventStatus::Voided),
            ..Self::default()
        }
    }

    /// Keep the status, only remember why the last attempt failed.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(error.into())),
            ..Self::default()
        }
    }
}

/// Read-through copy of a remote entity, used for offline display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub entity_type: EntityType,
    /// Client id.
    pub id: String,
    pub server_id: Option<String>,
    pub data: Value,
    pub sync_status: EntitySyncStatus,
    /// Inline error message (e.g. "insufficient stock").
    pub sync_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CachedEntity {
    /// Cache row for a local snapshot that still awaits confirmation.
    pub fn pending(payload: &EntityPayload, data: Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_type: payload.entity_type(),
            id: payload.entity_id().to_string(),
            server_id: payload.server_id().map(str::to_string),
            data,
            sync_status: EntitySyncStatus::Pending,
            sync_error: None,
            updated_at,
        }
    }
}

/// Counts of queued work by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub mutations_pending: usize,
    pub mutations_syncing: usize,
    pub mutations_failed: usize,
    pub events_pending: usize,
    pub events_synced: usize,
    pub events_failed: usize,
    pub events_voided: usize,
}

impl QueueStats {
    /// Whether there is any unresolved work left.
    pub fn has_unsynced_work(&self) -> bool {
        self.mutations_pending + self.mutations_syncing + self.events_pending > 0
    }
}
