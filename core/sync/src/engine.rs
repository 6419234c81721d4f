//! Mutation sync engine: drains the local queue against the POS API.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use tillsync_common::{
    Clock, Connectivity, EntityPayload, EntitySyncStatus, EntityType, Error, MutationStatus,
    Operation, QueueId, Result,
};
use tillsync_remote::{resource_path, ApiRequest, ResilientClient};
use tillsync_store::{
    CachedEntity, LocalStore, MutationPatch, MutationQueueItem, NewMutation, QueueStats,
};

use crate::config::SyncConfig;
use crate::conflict::{
    fields_match, last_write_winner, recreate_key, response_server_id, ConflictInfo,
    ConflictResolution, ConflictStrategy, PREFERENCE_KEY,
};
use crate::notify::{percent, RunOutcome, SkipReason, SyncEvent, SyncFailure, SyncSummary};
use crate::state::{EngineState, SyncStats};

/// Reason reported when the breaker stops a run.
const SERVICE_DEGRADED: &str = "service degraded";

/// How one queue item ended within a run.
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    Synced,
    /// A 409 settled without operator input.
    Resolved,
    /// Left `Pending`; later items of the same entity must wait.
    Deferred,
    Failed,
    Suspended,
    /// Stop the whole run.
    Halted(String),
}

/// Drains the mutation queue, one item at a time, oldest first.
///
/// Only one run is ever in flight. While a conflict awaits an operator
/// decision the engine is suspended and ignores every trigger.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    client: Arc<ResilientClient>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    state: RwLock<EngineState>,
    conflict: Mutex<Option<ConflictInfo>>,
    stats: RwLock<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        client: Arc<ResilientClient>,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            client,
            clock,
            connectivity,
            config,
            state: RwLock::new(EngineState::Idle),
            conflict: Mutex::new(None),
            stats: RwLock::new(SyncStats::default()),
            events,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    /// The conflict the engine is suspended on, if any.
    pub async fn pending_conflict(&self) -> Option<ConflictInfo> {
        self.conflict.lock().await.clone()
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.store.queue_stats()
    }

    pub fn mutations(&self) -> Result<Vec<MutationQueueItem>> {
        self.store.mutations()
    }

    /// Record a local change and queue it for the server.
    ///
    /// The cache row is updated immediately so listings show the change as
    /// pending while offline.
    ///
    /// # Errors
    /// - `InvalidInput` if the payload does not validate
    /// - `Storage` if the queue cannot be written; the change is lost
    pub fn enqueue(&self, operation: Operation, entity: EntityPayload) -> Result<QueueId> {
        entity.validate(operation)?;
        let now = self.clock.now();
        let entity_type = entity.entity_type();

        match operation {
            Operation::Delete => {
                self.store.set_entity_sync_state(
                    entity_type,
                    entity.entity_id(),
                    EntitySyncStatus::Pending,
                    None,
                    None,
                )?;
            }
            Operation::Create | Operation::Update => {
                let existing = self.store.cached_entity(entity_type, entity.entity_id())?;
                let mut row = CachedEntity::pending(&entity, entity.to_value()?, now);
                if row.server_id.is_none() {
                    row.server_id = existing.and_then(|e| e.server_id);
                }
                self.store.upsert_cached_entity(&row)?;
            }
        }

        let id = self.store.enqueue_mutation(NewMutation {
            operation,
            entity,
            timestamp: now,
        })?;
        info!("Queued {} as #{}", operation, id);
        Ok(id)
    }

    /// Put a failed item back in the queue with a fresh attempt budget.
    pub fn retry_failed(&self, id: QueueId) -> Result<()> {
        let item = self
            .store
            .mutation(id)?
            .ok_or_else(|| Error::NotFound(format!("Queue item {}", id)))?;
        if item.status != MutationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Queue item {} is {}, only FAILED items can be retried",
                id, item.status
            )));
        }
        self.store.update_mutation(
            id,
            &MutationPatch::status(MutationStatus::Pending)
                .with_attempts(0)
                .clear_error(),
        )?;
        self.store.set_entity_sync_state(
            item.entity_type(),
            item.entity_id(),
            EntitySyncStatus::Pending,
            None,
            None,
        )?;
        info!("Queue item #{} reset for retry", id);
        Ok(())
    }

    /// Drop a queued item without sending it.
    pub async fn discard(&self, id: QueueId) -> Result<()> {
        if *self.state.read().await == EngineState::AwaitingConflictResolution(id) {
            return Err(Error::InvalidInput(format!(
                "Queue item {} awaits conflict resolution; resolve or reject it first",
                id
            )));
        }
        if self.store.mutation(id)?.is_none() {
            return Err(Error::NotFound(format!("Queue item {}", id)));
        }
        self.store.delete_mutation(id)?;
        warn!("Discarded queue item #{}", id);
        Ok(())
    }

    /// Stored automatic resolution preference.
    pub fn conflict_preference(&self) -> Result<Option<ConflictStrategy>> {
        self.store
            .setting(PREFERENCE_KEY)?
            .map(|value| value.parse())
            .transpose()
    }

    /// Store (or clear) the automatic resolution preference.
    ///
    /// # Errors
    /// - `InvalidInput` for anything but `LastWriteWins`; other strategies
    ///   are only ever chosen by an operator
    pub fn set_conflict_preference(&self, strategy: Option<ConflictStrategy>) -> Result<()> {
        match strategy {
            Some(strategy) if !strategy.is_automatic() => Err(Error::InvalidInput(format!(
                "{} cannot be applied automatically",
                strategy
            ))),
            Some(strategy) => self.store.set_setting(PREFERENCE_KEY, strategy.as_str()),
            None => self.store.clear_setting(PREFERENCE_KEY),
        }
    }

    /// Drain the queue once.
    ///
    /// Returns `Skipped` without touching the queue when offline, already
    /// running, or suspended on a conflict.
    pub async fn run(&self) -> Result<RunOutcome> {
        if !self.connectivity.is_online() {
            debug!("Offline, sync run skipped");
            return Ok(self.skip(SkipReason::Offline));
        }

        {
            let mut state = self.state.write().await;
            match *state {
                EngineState::Idle => *state = EngineState::Running,
                EngineState::Running => return Ok(self.skip(SkipReason::AlreadyRunning)),
                EngineState::AwaitingConflictResolution(id) => {
                    return Ok(self.skip(SkipReason::AwaitingConflict(id)))
                }
            }
        }

        let result = self.drain().await;

        {
            let mut state = self.state.write().await;
            if *state == EngineState::Running {
                *state = EngineState::Idle;
            }
        }

        if let Err(e) = &result {
            error!("Sync run aborted: {}", e);
            self.stats.write().await.last_error = Some(e.to_string());
        }
        result
    }

    async fn drain(&self) -> Result<RunOutcome> {
        let start = Instant::now();
        self.stats.write().await.mark_run_started(self.clock.now());

        let items = self.store.pending_mutations()?;
        let total = items.len();
        info!("Starting sync run with {} pending mutations", total);
        self.emit(SyncEvent::Started { total });

        let mut summary = SyncSummary::default();
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for (index, item) in items.into_iter().enumerate() {
            if !self.connectivity.is_online() {
                warn!("Connectivity lost, stopping run");
                summary.halted = true;
                break;
            }

            let key = (item.entity_type(), item.entity_id().to_string());
            let outcome = if blocked.contains(&key) {
                debug!("#{} waits behind an earlier change to {}", item.id, key.1);
                ItemOutcome::Deferred
            } else {
                self.process_item(&item).await?
            };

            summary.processed += 1;
            match outcome {
                ItemOutcome::Synced => summary.synced += 1,
                ItemOutcome::Resolved => summary.conflicts_resolved += 1,
                ItemOutcome::Failed => summary.failed += 1,
                ItemOutcome::Deferred => {
                    summary.deferred += 1;
                    blocked.insert(key);
                }
                ItemOutcome::Suspended => {
                    summary.duration = start.elapsed();
                    info!("Sync run suspended on conflict for #{}", item.id);
                    return Ok(RunOutcome::Suspended {
                        queue_id: item.id,
                        summary,
                    });
                }
                ItemOutcome::Halted(reason) => {
                    summary.deferred += 1;
                    summary.halted = true;
                    warn!("Sync run halted: {}", reason);
                    self.emit(SyncEvent::Failed(SyncFailure::Run { reason }));
                    break;
                }
            }

            self.emit(SyncEvent::Progress {
                percent: percent(index + 1, total),
                current: index + 1,
                total,
            });
        }

        summary.duration = start.elapsed();
        info!(
            "Sync run completed in {:?}: {} synced, {} resolved, {} failed, {} deferred",
            summary.duration,
            summary.synced,
            summary.conflicts_resolved,
            summary.failed,
            summary.deferred
        );
        self.emit(SyncEvent::Completed {
            summary: summary.clone(),
        });
        Ok(RunOutcome::Completed(summary))
    }

    async fn process_item(&self, item: &MutationQueueItem) -> Result<ItemOutcome> {
        debug!(
            "Processing #{}: {} {} {}",
            item.id,
            item.operation,
            item.entity_type(),
            item.entity_id()
        );
        self.store
            .update_mutation(item.id, &MutationPatch::status(MutationStatus::Syncing))?;

        let target = self.remote_target(item)?;
        match self.send(item, &target).await {
            Ok(body) => {
                self.complete_item(item, response_server_id(&body).as_deref())?;
                Ok(ItemOutcome::Synced)
            }
            Err(Error::Conflict { .. }) if item.entity_type().supports_conflict_resolution() => {
                self.handle_conflict(item, &target).await
            }
            Err(err) if item.operation == Operation::Delete && err.status() == Some(404) => {
                debug!("#{}: already deleted on server", item.id);
                self.complete_item(item, None)?;
                Ok(ItemOutcome::Synced)
            }
            Err(Error::CircuitOpen) => {
                self.store
                    .update_mutation(item.id, &MutationPatch::status(MutationStatus::Pending))?;
                Ok(ItemOutcome::Halted(SERVICE_DEGRADED.to_string()))
            }
            Err(err) => self.record_failure(item, err).await,
        }
    }

    /// Remote id to address: learned server id, then snapshot server id,
    /// then the client id.
    fn remote_target(&self, item: &MutationQueueItem) -> Result<String> {
        let cached = self
            .store
            .cached_entity(item.entity_type(), item.entity_id())?
            .and_then(|c| c.server_id);
        Ok(cached
            .or_else(|| item.entity.server_id().map(str::to_string))
            .unwrap_or_else(|| item.entity_id().to_string()))
    }

    async fn send(&self, item: &MutationQueueItem, target: &str) -> Result<Value> {
        let collection = item.entity_type().collection();
        let request = match item.operation {
            Operation::Create => ApiRequest::post(collection, item.entity.to_value()?)
                .with_idempotency_key(item.entity_id()),
            Operation::Update => {
                ApiRequest::put(resource_path(collection, target), item.entity.to_value()?)
            }
            Operation::Delete => ApiRequest::delete(resource_path(collection, target)),
        };
        self.client.execute(request).await
    }

    /// Success bookkeeping: cache first, then drop the item.
    fn complete_item(&self, item: &MutationQueueItem, server_id: Option<&str>) -> Result<()> {
        if item.operation == Operation::Delete {
            self.store
                .remove_cached_entity(item.entity_type(), item.entity_id())?;
        } else {
            self.store.set_entity_sync_state(
                item.entity_type(),
                item.entity_id(),
                EntitySyncStatus::Synced,
                server_id,
                None,
            )?;
        }
        self.store.delete_mutation(item.id)?;
        debug!("#{} synced", item.id);
        Ok(())
    }

    async fn record_failure(&self, item: &MutationQueueItem, err: Error) -> Result<ItemOutcome> {
        let attempts = item.attempts + 1;
        let message = err.to_string();

        if attempts > self.config.max_attempts_before_failure {
            error!("#{} failed permanently after {} attempts: {}", item.id, attempts, message);
            self.store.update_mutation(
                item.id,
                &MutationPatch::status(MutationStatus::Failed)
                    .with_attempts(attempts)
                    .with_error(&message),
            )?;
            if err.is_client_error() {
                self.store.set_entity_sync_state(
                    item.entity_type(),
                    item.entity_id(),
                    EntitySyncStatus::Error,
                    None,
                    Some(&err.message()),
                )?;
            }
            self.stats.write().await.mark_failed(&message);
            self.emit(SyncEvent::Failed(SyncFailure::Item {
                queue_id: item.id,
                entity_id: item.entity_id().to_string(),
                error: message,
            }));
            return Ok(ItemOutcome::Failed);
        }

        self.store.update_mutation(
            item.id,
            &MutationPatch::status(MutationStatus::Pending)
                .with_attempts(attempts)
                .with_error(&message),
        )?;
        let delay = self.config.backoff_for(attempts);
        warn!(
            "#{} attempt {} failed: {}. Continuing in {:?}",
            item.id, attempts, message, delay
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(ItemOutcome::Deferred)
    }

    async fn handle_conflict(&self, item: &MutationQueueItem, target: &str) -> Result<ItemOutcome> {
        let path = resource_path(item.entity_type().collection(), target);
        let (server_data, server_deleted) = match self.client.get(path).await {
            Ok(body) => (Some(body), false),
            Err(err) if err.status() == Some(404) => (None, true),
            Err(err) => {
                // Not the item's fault; no attempt consumed.
                warn!("#{}: could not fetch server version: {}", item.id, err);
                self.store.update_mutation(
                    item.id,
                    &MutationPatch::status(MutationStatus::Pending).with_error(err.to_string()),
                )?;
                return Ok(match err {
                    Error::CircuitOpen => ItemOutcome::Halted(SERVICE_DEGRADED.to_string()),
                    _ => ItemOutcome::Deferred,
                });
            }
        };
        let local_data = item.entity.to_value()?;
        let preference = self.conflict_preference()?;

        if preference == Some(ConflictStrategy::LastWriteWins) {
            if let Some(server) = &server_data {
                return self.auto_resolve(item, target, server).await;
            }
        }

        // A delete is only done once the server no longer has the entity.
        if item.operation != Operation::Delete {
            if let Some(server) = &server_data {
                if fields_match(item.entity_type(), &local_data, server) {
                    info!("#{}: server already has this version", item.id);
                    self.complete_item(item, response_server_id(server).as_deref())?;
                    return Ok(ItemOutcome::Synced);
                }
            }
        }

        let info = ConflictInfo {
            queue_id: item.id,
            item: item.clone(),
            local_data,
            server_data,
            server_deleted,
            detected_at: self.clock.now(),
        };
        self.stats.write().await.mark_conflict_detected();
        *self.conflict.lock().await = Some(info.clone());
        *self.state.write().await = EngineState::AwaitingConflictResolution(item.id);
        warn!(
            "Conflict on {} {} (#{}), awaiting resolution",
            item.entity_type(),
            item.entity_id(),
            item.id
        );
        self.emit(SyncEvent::Conflict(info));
        Ok(ItemOutcome::Suspended)
    }

    /// Settle a conflict by the stored last-write-wins preference. A failed
    /// apply counts as an attempt like any other send failure.
    async fn auto_resolve(
        &self,
        item: &MutationQueueItem,
        target: &str,
        server: &Value,
    ) -> Result<ItemOutcome> {
        let strategy = ConflictStrategy::LastWriteWins;
        info!("#{}: applying preferred {} resolution", item.id, strategy);
        match self
            .apply_resolution(item, target, strategy, None, Some(server), false)
            .await
        {
            Ok(()) => Ok(ItemOutcome::Resolved),
            Err(Error::CircuitOpen) => Ok(ItemOutcome::Halted(SERVICE_DEGRADED.to_string())),
            Err(err) if matches!(err, Error::Storage(_)) => Err(err),
            Err(err) => self.record_failure(item, err).await,
        }
    }

    /// Apply the decision for the conflict the engine is suspended on, then
    /// continue draining the queue.
    ///
    /// # Errors
    /// - `InvalidInput` if no conflict is pending for `queue_id`, or the
    ///   resolution (merged entity included) is malformed; the engine stays
    ///   suspended on the same conflict
    /// - The remote error if applying failed; the item is back to `Pending`
    pub async fn resolve_conflict(
        &self,
        queue_id: QueueId,
        resolution: ConflictResolution,
    ) -> Result<RunOutcome> {
        resolution.validate()?;
        let pending = self.peek_conflict(queue_id).await?;
        let merged = merged_entity(&pending.item, &resolution)?;
        let info = self.take_conflict(queue_id).await?;

        let target = self.remote_target(&info.item)?;
        let server_deleted = info.server_deleted || resolution.server_deleted;
        let applied = self
            .apply_resolution(
                &info.item,
                &target,
                resolution.strategy,
                merged.as_ref(),
                info.server_data.as_ref(),
                server_deleted,
            )
            .await;
        *self.state.write().await = EngineState::Idle;
        applied?;

        info!("Conflict on #{} resolved with {}", queue_id, resolution.strategy);
        self.run().await
    }

    /// Leave the conflict unresolved: the item goes back to `Pending` and
    /// the engine becomes idle.
    pub async fn reject_conflict(&self, queue_id: QueueId) -> Result<()> {
        let info = self.take_conflict(queue_id).await?;
        let result = self.store.update_mutation(
            info.queue_id,
            &MutationPatch::status(MutationStatus::Pending),
        );
        *self.state.write().await = EngineState::Idle;
        info!("Conflict on #{} rejected, item requeued", queue_id);
        result
    }

    async fn ensure_awaiting(&self, queue_id: QueueId) -> Result<()> {
        let state = *self.state.read().await;
        if state != EngineState::AwaitingConflictResolution(queue_id) {
            return Err(Error::InvalidInput(format!(
                "No conflict pending for queue item {} (engine is {})",
                queue_id, state
            )));
        }
        Ok(())
    }

    async fn peek_conflict(&self, queue_id: QueueId) -> Result<ConflictInfo> {
        self.ensure_awaiting(queue_id).await?;
        self.conflict.lock().await.clone().ok_or_else(|| no_conflict(queue_id))
    }

    async fn take_conflict(&self, queue_id: QueueId) -> Result<ConflictInfo> {
        self.ensure_awaiting(queue_id).await?;
        self.conflict.lock().await.take().ok_or_else(|| no_conflict(queue_id))
    }

    /// Carry out a resolution; on failure the item goes back to `Pending`
    /// with the error, and a merge decision is kept in the queue.
    async fn apply_resolution(
        &self,
        item: &MutationQueueItem,
        target: &str,
        strategy: ConflictStrategy,
        merged: Option<&EntityPayload>,
        server_data: Option<&Value>,
        server_deleted: bool,
    ) -> Result<()> {
        let result = self
            .execute_resolution(item, target, strategy, merged, server_data, server_deleted)
            .await;

        match result {
            Ok(()) => {
                self.store.delete_mutation(item.id)?;
                self.stats
                    .write()
                    .await
                    .mark_conflict_resolved(self.clock.now());
                Ok(())
            }
            Err(err) => {
                warn!("#{}: applying {} failed: {}", item.id, strategy, err);
                if let Some(merged) = merged {
                    let operation = if server_deleted {
                        Operation::Create
                    } else {
                        Operation::Update
                    };
                    self.store.replace_mutation_payload(item.id, operation, merged)?;
                }
                self.store.update_mutation(
                    item.id,
                    &MutationPatch::status(MutationStatus::Pending).with_error(err.to_string()),
                )?;
                Err(err)
            }
        }
    }

    async fn execute_resolution(
        &self,
        item: &MutationQueueItem,
        target: &str,
        strategy: ConflictStrategy,
        merged: Option<&EntityPayload>,
        server_data: Option<&Value>,
        server_deleted: bool,
    ) -> Result<()> {
        let strategy = match strategy {
            ConflictStrategy::LastWriteWins => match server_data {
                Some(server) if !server_deleted => {
                    last_write_winner(item.entity.last_modified(), server)
                }
                _ => ConflictStrategy::KeepLocal,
            },
            other => other,
        };
        let entity_type = item.entity_type();
        let collection = entity_type.collection();

        match strategy {
            ConflictStrategy::KeepServer if server_deleted => {
                self.store.remove_cached_entity(entity_type, item.entity_id())
            }
            ConflictStrategy::KeepServer => {
                let server = server_data.ok_or_else(|| {
                    Error::InvalidInput("Server version unavailable".to_string())
                })?;
                let updated = item.entity.overwritten_from_server(server)?;
                self.store_synced(&updated, response_server_id(server))
            }
            ConflictStrategy::KeepLocal | ConflictStrategy::Merge => {
                let entity = merged.unwrap_or(&item.entity);
                if item.operation == Operation::Delete && merged.is_none() {
                    if !server_deleted {
                        let path = resource_path(collection, target);
                        match self.client.execute(ApiRequest::delete(path)).await {
                            Err(err) if err.status() != Some(404) => return Err(err),
                            _ => {}
                        }
                    }
                    return self.store.remove_cached_entity(entity_type, item.entity_id());
                }

                let body = if server_deleted {
                    let request = ApiRequest::post(collection, strip_server_id(entity.to_value()?))
                        .with_idempotency_key(recreate_key(item.entity_id(), item.id));
                    self.client.execute(request).await?
                } else {
                    let path = resource_path(collection, target);
                    self.client
                        .execute(ApiRequest::put(path, entity.to_value()?))
                        .await?
                };
                self.store_synced(entity, response_server_id(&body))
            }
            ConflictStrategy::LastWriteWins => Ok(()),
        }
    }

    /// Write a confirmed version into the cache.
    fn store_synced(&self, entity: &EntityPayload, server_id: Option<String>) -> Result<()> {
        let mut row = CachedEntity::pending(entity, entity.to_value()?, self.clock.now());
        row.sync_status = EntitySyncStatus::Synced;
        if server_id.is_some() {
            row.server_id = server_id;
        } else if row.server_id.is_none() {
            row.server_id = self
                .store
                .cached_entity(entity.entity_type(), entity.entity_id())?
                .and_then(|c| c.server_id);
        }
        self.store.upsert_cached_entity(&row)
    }

    fn skip(&self, reason: SkipReason) -> RunOutcome {
        self.emit(SyncEvent::Skipped { reason });
        RunOutcome::Skipped(reason)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// The operator's merged entity, checked before the conflict is consumed.
fn merged_entity(
    item: &MutationQueueItem,
    resolution: &ConflictResolution,
) -> Result<Option<EntityPayload>> {
    match (&resolution.strategy, &resolution.merged_payload) {
        (ConflictStrategy::Merge, Some(payload)) => {
            let merged = item.entity.merged_with(payload)?;
            merged.validate(Operation::Update)?;
            Ok(Some(merged))
        }
        _ => Ok(None),
    }
}

fn no_conflict(queue_id: QueueId) -> Error {
    Error::InvalidInput(format!("No conflict pending for queue item {}", queue_id))
}

/// A recreated entity gets a new server id; never send the stale one.
fn strip_server_id(mut value: Value) -> Value {
    if let Value::Object(fields) = &mut value {
        fields.remove("server_id");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tillsync_common::{ConnectivityFlag, ManualClock, Product};
    use tillsync_remote::testing::{Reply, ScriptedTransport};
    use tillsync_remote::{ClientConfig, Method, RetryConfig};
    use tillsync_store::SqliteStore;

    struct Harness {
        engine: SyncEngine,
        store: Arc<SqliteStore>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
        online: Arc<ConnectivityFlag>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(ManualClock::default());
        let online = Arc::new(ConnectivityFlag::default());
        let client =
            ResilientClient::new(transport.clone(), &ClientConfig::default(), clock.clone())
                .with_retry(
                    RetryConfig::new(1)
                        .with_initial_delay(Duration::ZERO)
                        .with_max_jitter(Duration::ZERO),
                );
        let config = SyncConfig {
            backoff_base_ms: 0,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(client),
            clock.clone(),
            online.clone(),
            config,
        );
        Harness {
            engine,
            store,
            transport,
            clock,
            online,
        }
    }

    fn conflict_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<ConflictInfo> {
        let mut conflicts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Conflict(info) = event {
                conflicts.push(info);
            }
        }
        conflicts
    }

    fn product(id: &str, quantity: i64) -> EntityPayload {
        EntityPayload::Products(Product {
            id: id.to_string(),
            server_id: None,
            name: "Coffee".to_string(),
            sku: Some("COF-1".to_string()),
            category: None,
            price: 2.5,
            quantity,
            updated_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_enqueue_validates_and_caches() {
        let h = harness();
        let mut bad = product("p1", 1);
        let EntityPayload::Products(p) = &mut bad;
        p.quantity = -2;
        assert!(h.engine.enqueue(Operation::Create, bad).is_err());
        assert!(h.store.mutations().unwrap().is_empty());

        h.engine.enqueue(Operation::Create, product("p1", 1)).unwrap();
        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.sync_status, EntitySyncStatus::Pending);
        assert_eq!(h.store.pending_mutations().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_uses_client_id_as_idempotency_key() {
        let h = harness();
        h.engine.enqueue(Operation::Create, product("p1", 1)).unwrap();
        h.transport
            .push(Method::POST, "products", Reply::ok(json!({"id": "srv-1"})));

        let outcome = h.engine.run().await.unwrap();
        assert_eq!(outcome.summary().unwrap().synced, 1);

        let calls = h.transport.calls();
        assert_eq!(calls[0].idempotency_key.as_deref(), Some("p1"));
        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.server_id.as_deref(), Some("srv-1"));
        assert_eq!(cached.sync_status, EntitySyncStatus::Synced);
        assert!(h.store.mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_targets_learned_server_id() {
        let h = harness();
        h.engine.enqueue(Operation::Create, product("p1", 1)).unwrap();
        h.engine.enqueue(Operation::Update, product("p1", 4)).unwrap();
        h.transport
            .push(Method::POST, "products", Reply::ok(json!({"id": "srv-1"})));
        h.transport
            .push(Method::PUT, "products/srv-1", Reply::ok(json!({"id": "srv-1"})));

        h.engine.run().await.unwrap();
        assert_eq!(h.transport.calls_to(&Method::PUT, "products/srv-1").len(), 1);
        assert!(h.store.mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_run_is_skipped() {
        let h = harness();
        h.engine.enqueue(Operation::Update, product("p1", 1)).unwrap();
        h.online.set_online(false);
        let mut rx = h.engine.subscribe();

        let outcome = h.engine.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::Offline));
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::Skipped {
                reason: SkipReason::Offline
            }
        );
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.store.pending_mutations().unwrap()[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_delete_404_counts_as_success() {
        let h = harness();
        h.engine.enqueue(Operation::Delete, product("p1", 1)).unwrap();
        h.transport
            .push(Method::DELETE, "products/p1", Reply::status(404, "not found"));

        let outcome = h.engine.run().await.unwrap();
        assert_eq!(outcome.summary().unwrap().synced, 1);
        assert!(h.store.mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_defers_later_changes_to_same_entity() {
        let h = harness();
        h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.engine.enqueue(Operation::Update, product("p1", 3)).unwrap();
        h.engine.enqueue(Operation::Update, product("p2", 1)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(500, "boom"));
        h.transport
            .push(Method::PUT, "products/p2", Reply::ok(json!({})));

        let summary = h.engine.run().await.unwrap().summary().cloned().unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.deferred, 2);
        assert_eq!(h.transport.calls_to(&Method::PUT, "products/p1").len(), 1);

        let pending = h.store.pending_mutations().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_client_error_fails_with_entity_badge() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport.always(
            Method::PUT,
            "products/p1",
            Reply::rejected(422, "insufficient stock", "INSUFFICIENT_STOCK"),
        );
        let mut rx = h.engine.subscribe();

        for _ in 0..6 {
            h.engine.run().await.unwrap();
        }
        let item = h.store.mutation(id).unwrap().unwrap();
        assert_eq!(item.status, MutationStatus::Failed);
        assert_eq!(item.attempts, 6);

        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.sync_status, EntitySyncStatus::Error);
        assert_eq!(cached.sync_error.as_deref(), Some("insufficient stock"));

        let mut saw_item_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Failed(SyncFailure::Item { queue_id, .. }) = event {
                assert_eq!(queue_id, id);
                saw_item_failure = true;
            }
        }
        assert!(saw_item_failure);

        h.engine.retry_failed(id).unwrap();
        let item = h.store.mutation(id).unwrap().unwrap();
        assert_eq!(item.status, MutationStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn test_circuit_open_halts_without_consuming_attempts() {
        let h = harness();
        h.engine.enqueue(Operation::Update, product("p1", 1)).unwrap();
        h.engine.enqueue(Operation::Update, product("p2", 1)).unwrap();
        h.transport
            .always(Method::PUT, "products/p1", Reply::status(503, "busy"));

        // Five server failures open the breaker.
        for _ in 0..5 {
            h.engine.run().await.unwrap();
        }
        let before: Vec<u32> = h
            .store
            .pending_mutations()
            .unwrap()
            .iter()
            .map(|i| i.attempts)
            .collect();
        let calls = h.transport.call_count();

        let mut rx = h.engine.subscribe();
        let summary = h.engine.run().await.unwrap().summary().cloned().unwrap();
        assert!(summary.halted);
        assert_eq!(h.transport.call_count(), calls);

        let after: Vec<u32> = h
            .store
            .pending_mutations()
            .unwrap()
            .iter()
            .map(|i| i.attempts)
            .collect();
        assert_eq!(before, after);

        let mut saw_degraded = false;
        while let Ok(event) = rx.try_recv() {
            if event
                == SyncEvent::Failed(SyncFailure::Run {
                    reason: "service degraded".to_string(),
                })
            {
                saw_degraded = true;
            }
        }
        assert!(saw_degraded);
    }

    #[tokio::test]
    async fn test_identical_content_short_circuits() {
        let h = harness();
        h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport.push(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"id": "p1", "name": "Coffee", "sku": "COF-1",
                             "category": null, "price": 2.5, "quantity": 5})),
        );

        let outcome = h.engine.run().await.unwrap();
        assert_eq!(outcome.summary().unwrap().synced, 1);
        assert_eq!(h.engine.state().await, EngineState::Idle);
        assert!(h.store.mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_suspends_and_resolves_with_keep_server() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.engine.enqueue(Operation::Update, product("p2", 1)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport.push(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"id": "p1", "name": "Coffee", "sku": "COF-1", "price": 2.5,
                             "quantity": 9, "updatedAt": "2026-01-01T00:00:00Z"})),
        );

        let outcome = h.engine.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { queue_id, .. } if queue_id == id));
        assert_eq!(h.engine.state().await, EngineState::AwaitingConflictResolution(id));
        assert_eq!(
            h.engine.run().await.unwrap(),
            RunOutcome::Skipped(SkipReason::AwaitingConflict(id))
        );

        let conflict = h.engine.pending_conflict().await.unwrap();
        assert_eq!(conflict.server_data.as_ref().unwrap()["quantity"], 9);
        assert!(!conflict.server_deleted);

        h.transport
            .push(Method::PUT, "products/p2", Reply::ok(json!({})));
        let outcome = h
            .engine
            .resolve_conflict(id, ConflictResolution::new(ConflictStrategy::KeepServer))
            .await
            .unwrap();
        assert_eq!(outcome.summary().unwrap().synced, 1);
        assert_eq!(h.engine.state().await, EngineState::Idle);

        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.data["quantity"], 9);
        assert_eq!(cached.sync_status, EntitySyncStatus::Synced);
        assert!(h.store.mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_conflict_requeues_item() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport
            .push(Method::GET, "products/p1", Reply::ok(json!({"name": "Tea"})));

        h.engine.run().await.unwrap();
        assert!(h
            .engine
            .resolve_conflict(QueueId(999), ConflictResolution::new(ConflictStrategy::KeepLocal))
            .await
            .is_err());

        h.engine.reject_conflict(id).await.unwrap();
        assert_eq!(h.engine.state().await, EngineState::Idle);
        let item = h.store.mutation(id).unwrap().unwrap();
        assert_eq!(item.status, MutationStatus::Pending);
        assert_eq!(item.attempts, 0);
    }

    #[tokio::test]
    async fn test_merge_failure_persists_payload() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport
            .push(Method::GET, "products/p1", Reply::ok(json!({"name": "Tea", "quantity": 2})));
        h.engine.run().await.unwrap();

        h.transport
            .push(Method::PUT, "products/p1", Reply::status(500, "boom"));
        let err = h
            .engine
            .resolve_conflict(id, ConflictResolution::merge(json!({"name": "Tea", "quantity": 4})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(h.engine.state().await, EngineState::Idle);

        let item = h.store.mutation(id).unwrap().unwrap();
        assert_eq!(item.status, MutationStatus::Pending);
        assert!(item.last_error.is_some());
        let EntityPayload::Products(p) = item.entity;
        assert_eq!(p.quantity, 4);
        assert_eq!(p.name, "Tea");
    }

    #[tokio::test]
    async fn test_keep_local_recreates_deleted_entity() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport
            .push(Method::GET, "products/p1", Reply::status(404, "gone"));

        h.engine.run().await.unwrap();
        let conflict = h.engine.pending_conflict().await.unwrap();
        assert!(conflict.server_deleted);
        assert!(conflict.server_data.is_none());

        h.transport
            .push(Method::POST, "products", Reply::ok(json!({"id": "srv-2"})));
        h.engine
            .resolve_conflict(id, ConflictResolution::new(ConflictStrategy::KeepLocal))
            .await
            .unwrap();

        let post = &h.transport.calls_to(&Method::POST, "products")[0];
        assert_eq!(post.idempotency_key, Some(format!("p1:recreate:{}", id)));
        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.server_id.as_deref(), Some("srv-2"));
    }

    #[tokio::test]
    async fn test_last_write_wins_preference_skips_prompt() {
        let h = harness();
        h.engine
            .set_conflict_preference(Some(ConflictStrategy::LastWriteWins))
            .unwrap();
        assert!(h
            .engine
            .set_conflict_preference(Some(ConflictStrategy::Merge))
            .is_err());

        h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport.push(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"name": "Coffee", "quantity": 1,
                             "updatedAt": "2000-01-01T00:00:00Z"})),
        );
        h.transport
            .push(Method::PUT, "products/p1", Reply::ok(json!({})));

        let outcome = h.engine.run().await.unwrap();
        assert_eq!(outcome.summary().unwrap().conflicts_resolved, 1);
        assert_eq!(h.engine.state().await, EngineState::Idle);
        // Local was newer, so it was pushed again.
        assert_eq!(h.transport.calls_to(&Method::PUT, "products/p1").len(), 2);
        assert_eq!(h.engine.stats().await.conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_item() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.engine.discard(id).await.unwrap();
        assert!(h.store.mutation(id).unwrap().is_none());
        assert!(matches!(h.engine.discard(id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_conflict_event_carries_both_versions() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport.push(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"id": "p1", "name": "Coffee", "sku": "COF-1", "price": 2.5,
                             "quantity": 9})),
        );
        let mut rx = h.engine.subscribe();

        h.engine.run().await.unwrap();
        let conflicts = conflict_events(&mut rx);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].queue_id, id);
        assert_eq!(conflicts[0].local_data["quantity"], 5);
        assert_eq!(conflicts[0].server_data.as_ref().unwrap()["quantity"], 9);
    }

    #[tokio::test]
    async fn test_only_last_write_wins_can_be_preferred() {
        let h = harness();
        for strategy in [
            ConflictStrategy::KeepLocal,
            ConflictStrategy::KeepServer,
            ConflictStrategy::Merge,
        ] {
            assert!(matches!(
                h.engine.set_conflict_preference(Some(strategy)),
                Err(Error::InvalidInput(_))
            ));
        }
        assert_eq!(h.engine.conflict_preference().unwrap(), None);

        // A keep-local value written by an older build still prompts.
        h.store.set_setting(PREFERENCE_KEY, "KEEP_LOCAL").unwrap();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport
            .push(Method::GET, "products/p1", Reply::ok(json!({"name": "Tea", "quantity": 1})));
        let mut rx = h.engine.subscribe();

        let outcome = h.engine.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { queue_id, .. } if queue_id == id));
        assert_eq!(conflict_events(&mut rx).len(), 1);
        assert_eq!(h.transport.calls_to(&Method::PUT, "products/p1").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_merge_keeps_conflict_pending() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport
            .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
        h.transport
            .push(Method::GET, "products/p1", Reply::ok(json!({"name": "Tea", "quantity": 2})));
        h.engine.run().await.unwrap();

        let err = h
            .engine
            .resolve_conflict(id, ConflictResolution::merge(json!({"quantity": "lots"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_) | Error::InvalidInput(_)));
        let err = h
            .engine
            .resolve_conflict(id, ConflictResolution::merge(json!({"quantity": -3})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(h.engine.state().await, EngineState::AwaitingConflictResolution(id));
        assert!(h.engine.pending_conflict().await.is_some());
        assert_eq!(h.transport.calls_to(&Method::PUT, "products/p1").len(), 1);

        h.transport
            .push(Method::PUT, "products/p1", Reply::ok(json!({})));
        h.engine
            .resolve_conflict(id, ConflictResolution::merge(json!({"quantity": 4})))
            .await
            .unwrap();
        assert!(h.store.mutations().unwrap().is_empty());
        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.data["quantity"], 4);
    }

    #[tokio::test]
    async fn test_delete_conflict_is_never_short_circuited() {
        let h = harness();
        let id = h.engine.enqueue(Operation::Delete, product("p1", 5)).unwrap();
        h.transport
            .push(Method::DELETE, "products/p1", Reply::status(409, "stale"));
        h.transport.push(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"id": "p1", "name": "Coffee", "sku": "COF-1",
                             "category": null, "price": 2.5, "quantity": 5})),
        );

        let outcome = h.engine.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Suspended { queue_id, .. } if queue_id == id));
        assert!(h.store.mutation(id).unwrap().is_some());

        h.transport
            .push(Method::DELETE, "products/p1", Reply::ok(json!({})));
        h.engine
            .resolve_conflict(id, ConflictResolution::new(ConflictStrategy::KeepLocal))
            .await
            .unwrap();
        assert_eq!(h.transport.calls_to(&Method::DELETE, "products/p1").len(), 2);
        assert!(h.store.mutations().unwrap().is_empty());
        assert!(h
            .store
            .cached_entity(EntityType::Products, "p1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_queue_order_survives_clock_stepping_back() {
        let h = harness();
        h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.clock.set(h.clock.now() - chrono::Duration::seconds(2));
        h.engine.enqueue(Operation::Update, product("p1", 3)).unwrap();
        h.transport
            .always(Method::PUT, "products/p1", Reply::ok(json!({})));

        h.engine.run().await.unwrap();
        let quantities: Vec<Value> = h
            .transport
            .calls_to(&Method::PUT, "products/p1")
            .iter()
            .map(|call| call.body.as_ref().unwrap()["quantity"].clone())
            .collect();
        assert_eq!(quantities, vec![json!(5), json!(3)]);
    }

    #[tokio::test]
    async fn test_last_write_wins_apply_failure_counts_attempts() {
        let h = harness();
        h.engine
            .set_conflict_preference(Some(ConflictStrategy::LastWriteWins))
            .unwrap();
        let id = h.engine.enqueue(Operation::Update, product("p1", 5)).unwrap();
        h.transport.always(
            Method::GET,
            "products/p1",
            Reply::ok(json!({"name": "Coffee", "quantity": 1,
                             "updatedAt": "2000-01-01T00:00:00Z"})),
        );

        for run in 1..=6u32 {
            h.transport
                .push(Method::PUT, "products/p1", Reply::status(409, "stale"));
            h.transport
                .push(Method::PUT, "products/p1", Reply::status(422, "sku taken"));
            h.engine.run().await.unwrap();

            let item = h.store.mutation(id).unwrap().unwrap();
            assert_eq!(item.attempts, run);
            let expected = if run > 5 {
                MutationStatus::Failed
            } else {
                MutationStatus::Pending
            };
            assert_eq!(item.status, expected);
        }

        let cached = h.store.cached_entity(EntityType::Products, "p1").unwrap().unwrap();
        assert_eq!(cached.sync_status, EntitySyncStatus::Error);
        assert_eq!(cached.sync_error.as_deref(), Some("sku taken"));
    }
}
