//! Idempotent event log.
//!
//! Business events (completed sales) are appended locally and replayed to
//! `POST /events` with their id as idempotency key, so a replay after a lost
//! response never double-counts.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tillsync_common::{
    Clock, Connectivity, Error, EventId, EventStatus, EventType, Result, Sale,
};
use tillsync_remote::{ApiRequest, ResilientClient};
use tillsync_store::{EventPatch, LocalStore, PosEvent};

use crate::config::EventLogConfig;
use crate::notify::SkipReason;

/// Endpoint receiving business events.
pub const EVENTS_PATH: &str = "events";

/// Totals of one pass over the pending events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventSyncSummary {
    pub synced: usize,
    /// Rejected for good; needs an operator to void.
    pub rejected: usize,
    /// Left `Pending` for a later pass.
    pub deferred: usize,
    pub halted: bool,
    pub skipped: Option<SkipReason>,
}

/// Append-only log of business events with idempotent replay.
pub struct EventLog {
    store: Arc<dyn LocalStore>,
    client: Arc<ResilientClient>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    config: EventLogConfig,
    syncing: AtomicBool,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn LocalStore>,
        client: Arc<ResilientClient>,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
        config: EventLogConfig,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            connectivity,
            config,
            syncing: AtomicBool::new(false),
        }
    }

    /// Record a completed sale.
    ///
    /// # Errors
    /// - `InvalidInput` if the sale does not validate
    /// - `Storage` if the event cannot be persisted
    pub fn record_sale(&self, sale: &Sale) -> Result<EventId> {
        sale.validate()?;
        self.record(EventType::Sale, serde_json::to_value(sale)?)
    }

    /// Append an event with a fresh idempotency key.
    pub fn record(&self, event_type: EventType, payload: Value) -> Result<EventId> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(
                "Event payload must be a JSON object".to_string(),
            ));
        }
        let event = PosEvent::new(event_type, payload, self.clock.now());
        self.store.append_event(&event)?;
        info!("Recorded {} event {}", event_type, event.event_id);
        Ok(event.event_id)
    }

    /// Replay pending events, oldest first.
    ///
    /// Skipped when offline or when another pass is in flight. The open
    /// breaker stops the pass; remaining events stay `Pending`.
    pub async fn sync_pending(&self) -> Result<EventSyncSummary> {
        if !self.connectivity.is_online() {
            return Ok(EventSyncSummary {
                skipped: Some(SkipReason::Offline),
                ..EventSyncSummary::default()
            });
        }
        if self.syncing.swap(true, Ordering::AcqRel) {
            return Ok(EventSyncSummary {
                skipped: Some(SkipReason::AlreadyRunning),
                ..EventSyncSummary::default()
            });
        }
        let _flight = FlightGuard(&self.syncing);

        let mut summary = EventSyncSummary::default();
        let events = self.store.pending_events()?;
        if !events.is_empty() {
            info!("Syncing {} pending events", events.len());
        }

        for event in events {
            if !self.connectivity.is_online() {
                summary.halted = true;
                break;
            }

            let request = ApiRequest::post(EVENTS_PATH, event.payload.clone())
                .with_idempotency_key(event.event_id.as_str());
            match self.client.execute(request).await {
                Ok(body) => {
                    let transaction_id = transaction_id(&body);
                    debug!(
                        "Event {} synced (transaction {:?})",
                        event.event_id, transaction_id
                    );
                    self.store
                        .update_event(&event.event_id, &EventPatch::synced(transaction_id))?;
                    summary.synced += 1;
                }
                Err(Error::CircuitOpen) => {
                    warn!("Service degraded, event sync stopped");
                    summary.halted = true;
                    break;
                }
                Err(err) if self.is_rejection(&err) => {
                    warn!("Event {} rejected: {}", event.event_id, err);
                    self.store
                        .update_event(&event.event_id, &EventPatch::failed(err.message()))?;
                    summary.rejected += 1;
                }
                Err(err) if err.is_client_error() => {
                    // No configured rejection code; retried on every pass.
                    warn!(
                        "Event {} refused without a known rejection code, kept pending: {}",
                        event.event_id, err
                    );
                    self.store
                        .update_event(&event.event_id, &EventPatch::error(err.to_string()))?;
                    summary.deferred += 1;
                }
                Err(err) => {
                    debug!("Event {} deferred: {}", event.event_id, err);
                    self.store
                        .update_event(&event.event_id, &EventPatch::error(err.to_string()))?;
                    summary.deferred += 1;
                }
            }
        }

        if summary.synced + summary.rejected > 0 {
            info!(
                "Event sync: {} synced, {} rejected, {} deferred",
                summary.synced, summary.rejected, summary.deferred
            );
        }
        Ok(summary)
    }

    /// A 409 or a known business rejection code is final.
    fn is_rejection(&self, err: &Error) -> bool {
        if matches!(err, Error::Conflict { .. }) {
            return true;
        }
        err.code()
            .is_some_and(|code| self.config.rejection_codes.iter().any(|c| c == code))
    }

    /// Write off a rejected event.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `InvalidInput` unless the event is `Failed`
    pub fn void(&self, event_id: &EventId) -> Result<()> {
        let event = self
            .store
            .event(event_id)?
            .ok_or_else(|| Error::NotFound(format!("Event {}", event_id)))?;
        if event.status != EventStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Event {} is {}, only FAILED events can be voided",
                event_id, event.status
            )));
        }
        self.store.update_event(event_id, &EventPatch::voided())?;
        info!("Voided event {}", event_id);
        Ok(())
    }

    /// Delete synced events past the retention window.
    pub fn purge_synced(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.config.retention();
        let purged = self.store.purge_events(EventStatus::Synced, cutoff)?;
        if purged > 0 {
            info!("Purged {} synced events", purged);
        }
        Ok(purged)
    }

    pub fn failed_events(&self) -> Result<Vec<PosEvent>> {
        self.store.events_with_status(EventStatus::Failed)
    }

    pub fn events(&self, status: EventStatus) -> Result<Vec<PosEvent>> {
        self.store.events_with_status(status)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.store.pending_events()?.len())
    }
}

/// Clears the single-flight flag when the pass ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Transaction id from a success body.
fn transaction_id(body: &Value) -> Option<String> {
    ["transaction_id", "transactionId", "id"]
        .iter()
        .find_map(|key| match body.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
