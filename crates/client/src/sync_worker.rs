//! Background worker driving sync cycles.
//!
//! Triggers: a fixed timer, the offline-to-online transition and a change of
//! the active warehouse scope. All triggers go through the orchestrator's
//! single-flight guard. The scope is moved to the current cycle date before
//! each run, so a worker left running past local midnight syncs the new cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::offline::{ConnectivityState, OfflineMode};
use crate::sync_manager::{SyncError, SyncOrchestrator};
use crate::types::{SyncOutcome, SyncScope};

/// Background sync worker that periodically syncs the active scope.
pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    offline: OfflineMode,
    scope: watch::Receiver<Option<SyncScope>>,
    interval: Duration,
    cycle_offset_minutes: i32,
    shutdown: Arc<Notify>,
}

/// Handle to a running worker.
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync worker ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SyncWorker {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        offline: OfflineMode,
        scope: watch::Receiver<Option<SyncScope>>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            offline,
            scope,
            interval,
            cycle_offset_minutes: 0,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// UTC offset, in minutes, at which cycle dates roll over.
    pub fn with_cycle_offset(mut self, minutes: i32) -> Self {
        self.cycle_offset_minutes = minutes;
        self
    }

    /// Start the background sync worker.
    pub fn start(self) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        WorkerHandle { shutdown, task }
    }

    async fn run(mut self) {
        tracing::info!(interval = ?self.interval, "background sync worker started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut connectivity = self.offline.subscribe();
        let mut consecutive_failures = 0u32;

        loop {
            let trigger = tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("background sync worker received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if self.offline.should_queue() {
                        tracing::debug!("skipping timed sync while offline");
                        continue;
                    }
                    "timer"
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *connectivity.borrow_and_update() != ConnectivityState::Online {
                        continue;
                    }
                    "reconnect"
                }
                changed = self.scope.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    "scope change"
                }
            };

            let Some(scope) = *self.scope.borrow_and_update() else {
                continue;
            };
            let scope = scope.rolled_to(Utc::now(), self.cycle_offset_minutes);

            match self.orchestrator.sync_now(scope, false).await {
                Ok(SyncOutcome::Completed(_)) => consecutive_failures = 0,
                Ok(SyncOutcome::Skipped) => {}
                Err(SyncError::Offline) => tracing::debug!(trigger, "sync skipped: offline"),
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(trigger, failures = consecutive_failures, error = %e, "background sync failed");
                }
            }
        }

        tracing::info!("background sync worker stopped");
    }
}
