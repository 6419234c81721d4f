//! Sync scheduling: periodic, manual and connectivity-restored triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use tillsync_common::{Connectivity, Error, Result};

use crate::engine::SyncEngine;
use crate::events::EventLog;
use crate::notify::RunOutcome;

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Periodic,
    Manual,
    ConnectivityRestored,
}

#[derive(Debug)]
enum SchedulerRequest {
    Sync(SyncTrigger),
    Shutdown,
}

/// Background driver of the sync engine and the event log.
///
/// Every trigger spawns a cycle; the engine's own single-flight guard turns
/// overlapping cycles into no-ops.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    events: Option<Arc<EventLog>>,
    connectivity: Arc<dyn Connectivity>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        events: Option<Arc<EventLog>>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let interval = engine.config().sync_interval();
        Self {
            engine,
            events,
            connectivity,
            interval,
        }
    }

    /// Override the periodic interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the scheduler loop on the current runtime.
    pub fn spawn(self) -> SyncSchedulerHandle {
        let (request_tx, request_rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(request_rx));
        SyncSchedulerHandle { request_tx, task }
    }

    async fn run(self, mut request_rx: mpsc::Receiver<SchedulerRequest>) {
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();

        info!("Sync scheduler started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Some(SchedulerRequest::Sync(trigger)) => self.start_cycle(&mut cycles, trigger),
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    if self.connectivity.is_online() {
                        self.start_cycle(&mut cycles, SyncTrigger::Periodic);
                    } else {
                        debug!("Offline, periodic sync skipped");
                    }
                }

                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!("Sync cycle panicked: {}", e);
                    }
                }
            }
        }

        // Let in-flight cycles finish their current item.
        while cycles.join_next().await.is_some() {}
    }

    fn start_cycle(&self, cycles: &mut JoinSet<()>, trigger: SyncTrigger) {
        debug!("Sync triggered: {:?}", trigger);
        let engine = self.engine.clone();
        let events = self.events.clone();
        cycles.spawn(async move {
            run_cycle(&engine, events.as_deref(), trigger).await;
        });
    }
}

/// One mutation pass followed by an event pass and retention cleanup.
pub async fn run_cycle(engine: &SyncEngine, events: Option<&EventLog>, trigger: SyncTrigger) {
    match engine.run().await {
        Ok(RunOutcome::Completed(summary)) => {
            if summary.processed > 0 {
                info!(
                    "{:?} sync: {} synced, {} failed, {} deferred",
                    trigger, summary.synced, summary.failed, summary.deferred
                );
            }
        }
        Ok(RunOutcome::Suspended { queue_id, .. }) => {
            info!("{:?} sync suspended on conflict #{}", trigger, queue_id);
        }
        Ok(RunOutcome::Skipped(reason)) => debug!("{:?} sync skipped: {:?}", trigger, reason),
        Err(e) => error!("{:?} sync failed: {}", trigger, e),
    }

    let Some(events) = events else {
        return;
    };
    if let Err(e) = events.sync_pending().await {
        error!("Event sync failed: {}", e);
    }
    if let Err(e) = events.purge_synced() {
        error!("Event purge failed: {}", e);
    }
}

/// Handle to a running scheduler.
pub struct SyncSchedulerHandle {
    request_tx: mpsc::Sender<SchedulerRequest>,
    task: JoinHandle<()>,
}

impl SyncSchedulerHandle {
    /// Ask for a sync now.
    pub async fn request_sync(&self) -> Result<()> {
        self.send(SchedulerRequest::Sync(SyncTrigger::Manual)).await
    }

    /// Tell the scheduler the network is back.
    pub async fn notify_connectivity_restored(&self) -> Result<()> {
        self.send(SchedulerRequest::Sync(SyncTrigger::ConnectivityRestored))
            .await
    }

    /// Stop the loop and wait for in-flight cycles.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already be gone; joining is what matters.
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
        self.task
            .await
            .map_err(|e| Error::TerminalFailure(format!("Scheduler task failed: {}", e)))
    }

    async fn send(&self, request: SchedulerRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::TerminalFailure("Scheduler not running".to_string()))
    }
}
