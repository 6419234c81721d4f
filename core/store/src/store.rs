//! Local store trait definition.

use chrono::{DateTime, Utc};

use tillsync_common::{
    EntityPayload, EntitySyncStatus, EntityType, EventId, EventStatus, Operation, QueueId, Result,
};

use crate::records::{
    CachedEntity, EventPatch, MutationPatch, MutationQueueItem, NewMutation, PosEvent, QueueStats,
};

/// Durable storage for queued work and cached entities.
///
/// The store is the only shared mutable state of the sync core. Every change
/// goes through a narrow update or delete, never a read-modify-write across
/// components. It has no notion of connectivity.
pub trait LocalStore: Send + Sync {
    /// Append a mutation to the queue.
    ///
    /// # Errors
    /// - Storage unavailable. Callers must treat this as fatal to the action
    ///   that produced the mutation.
    fn enqueue_mutation(&self, mutation: NewMutation) -> Result<QueueId>;

    /// `Pending` mutations in insertion (queue id) order.
    fn pending_mutations(&self) -> Result<Vec<MutationQueueItem>>;

    /// Every queued mutation regardless of status, in queue id order.
    fn mutations(&self) -> Result<Vec<MutationQueueItem>>;

    fn mutation(&self, id: QueueId) -> Result<Option<MutationQueueItem>>;

    /// Update status, attempts or error of a mutation. Never touches the payload.
    ///
    /// # Errors
    /// - `NotFound` if no such item exists
    fn update_mutation(&self, id: QueueId, patch: &MutationPatch) -> Result<()>;

    /// Rewrite the snapshot of a mutation.
    ///
    /// Reserved for persisting an operator's merge decision.
    fn replace_mutation_payload(
        &self,
        id: QueueId,
        operation: Operation,
        entity: &EntityPayload,
    ) -> Result<()>;

    fn delete_mutation(&self, id: QueueId) -> Result<()>;

    /// Return items left `Syncing` by an interrupted run to `Pending`.
    fn requeue_interrupted(&self) -> Result<usize>;

    fn append_event(&self, event: &PosEvent) -> Result<()>;

    /// `Pending` events, oldest `created_at` first.
    fn pending_events(&self) -> Result<Vec<PosEvent>>;

    fn events_with_status(&self, status: EventStatus) -> Result<Vec<PosEvent>>;

    fn event(&self, id: &EventId) -> Result<Option<PosEvent>>;

    /// # Errors
    /// - `NotFound` if no such event exists
    fn update_event(&self, id: &EventId, patch: &EventPatch) -> Result<()>;

    /// Delete events with `status` created before `older_than`.
    fn purge_events(&self, status: EventStatus, older_than: DateTime<Utc>) -> Result<usize>;

    /// Overwrite the whole cache of one entity type.
    fn replace_cached_entities(&self, entity_type: EntityType, entities: &[CachedEntity])
        -> Result<()>;

    fn cached_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>>;

    fn cached_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>>;

    fn upsert_cached_entity(&self, entity: &CachedEntity) -> Result<()>;

    fn remove_cached_entity(&self, entity_type: EntityType, id: &str) -> Result<()>;

    /// Update the sync badge of a cached entity. A missing row is ignored.
    ///
    /// `server_id` is only written when provided.
    fn set_entity_sync_state(
        &self,
        entity_type: EntityType,
        id: &str,
        status: EntitySyncStatus,
        server_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    fn setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    fn clear_setting(&self, key: &str) -> Result<()>;

    fn queue_stats(&self) -> Result<QueueStats>;
}
