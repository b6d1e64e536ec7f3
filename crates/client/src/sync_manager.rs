//! Sync orchestrator.
//!
//! One cycle runs three strictly ordered steps:
//! - refresh the manifest snapshot when the remote fingerprint changed, when
//!   forced, or when the local snapshot is short
//! - drain the outbox in creation order
//! - pull the remote state and replace the cached snapshot
//!
//! Push precedes pull so a just-confirmed mutation is not overwritten by a pull
//! that predates it. Overlapping triggers collapse into the cycle in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use countsync_counting::ManifestItem;
use thiserror::Error;

use crate::applier::PendingIndicator;
use crate::offline::OfflineMode;
use crate::remote::{RemoteError, RemoteService};
use crate::store::{LocalStore, PendingEvent, StoreError};
use crate::types::{SyncOutcome, SyncResult, SyncScope};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("client is offline")]
    Offline,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("incomplete manifest: expected {expected} rows, fetched {fetched}")]
    IncompleteManifest { expected: u32, fetched: u32 },
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of pushing one outbox entry.
enum Delivery {
    Sent,
    Discarded,
    Failed,
}

pub struct SyncOrchestrator {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    offline: OfflineMode,
    pending: PendingIndicator,
    page_size: u32,
    in_flight: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        offline: OfflineMode,
        pending: PendingIndicator,
    ) -> Self {
        Self {
            store,
            remote,
            offline,
            pending,
            page_size: 1000,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one sync cycle for `scope`, or return `Skipped` if one is in flight.
    pub async fn sync_now(&self, scope: SyncScope, force_manifest: bool) -> Result<SyncOutcome, SyncError> {
        if self.offline.is_offline() {
            return Err(SyncError::Offline);
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!(cd = %scope.warehouse, "sync already in flight; trigger ignored");
            return Ok(SyncOutcome::Skipped);
        };

        tracing::info!(cd = %scope.warehouse, cycle = %scope.cycle_date, "sync started");
        match self.run(scope, force_manifest).await {
            Ok(result) => {
                tracing::info!(
                    cd = %scope.warehouse,
                    manifest_refreshed = result.manifest_refreshed,
                    sent = result.sent,
                    discarded = result.discarded,
                    failed = result.failed,
                    pending = result.pending,
                    "sync completed"
                );
                Ok(SyncOutcome::Completed(result))
            }
            Err(e) => {
                tracing::warn!(cd = %scope.warehouse, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    async fn run(&self, scope: SyncScope, force_manifest: bool) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult {
            manifest_refreshed: self.refresh_manifest(scope, force_manifest).await?,
            ..SyncResult::default()
        };

        let entries = self
            .store
            .outbox_list(scope.user, scope.warehouse, scope.cycle_date)
            .await?;
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "draining outbox");
        }
        for entry in &entries {
            match self.deliver(entry).await? {
                Delivery::Sent => result.sent += 1,
                Delivery::Discarded => result.discarded += 1,
                Delivery::Failed => result.failed += 1,
            }
        }

        let state = self.remote.sync_pull(scope.warehouse, scope.cycle_date, None).await?;
        self.store
            .put_remote_state(scope.user, scope.warehouse, scope.cycle_date, &state)
            .await?;

        result.pending = self.pending.refresh(&self.store, scope).await?;
        Ok(result)
    }

    /// Returns whether the local snapshot was replaced.
    async fn refresh_manifest(&self, scope: SyncScope, force: bool) -> Result<bool, SyncError> {
        let remote = self.remote.manifest_meta(scope.warehouse).await?;
        let local = self.store.manifest_meta(scope.user, scope.warehouse).await?;
        let local_len = self.store.manifest_len(scope.user, scope.warehouse).await?;

        let stale = local.as_ref().is_none_or(|meta| meta.is_stale_against(&remote));
        if !force && !stale && local_len >= remote.row_count {
            return Ok(false);
        }

        let items = self.download_manifest(scope, remote.row_count).await?;
        self.store.manifest_replace(scope.user, &remote, &items).await?;
        tracing::info!(
            cd = %scope.warehouse,
            rows = items.len(),
            fingerprint = %remote.fingerprint,
            forced = force,
            "manifest refreshed"
        );
        Ok(true)
    }

    async fn download_manifest(&self, scope: SyncScope, expected: u32) -> Result<Vec<ManifestItem>, SyncError> {
        let mut items: Vec<ManifestItem> = Vec::new();
        let mut offset = 0u32;
        loop {
            let page = self
                .remote
                .manifest_items_page(scope.warehouse, offset, self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let fetched = u32::try_from(page.len()).unwrap_or(u32::MAX);
            items.extend(page);
            offset = offset.saturating_add(fetched);
            tracing::debug!(rows = items.len(), total = expected, "manifest page fetched");
            if expected > 0 && items.len() >= expected as usize {
                break;
            }
            if fetched < self.page_size {
                break;
            }
        }

        let fetched = u32::try_from(items.len()).unwrap_or(u32::MAX);
        if expected > 0 && fetched != expected {
            return Err(SyncError::IncompleteManifest { expected, fetched });
        }
        Ok(items)
    }

    async fn deliver(&self, entry: &PendingEvent) -> Result<Delivery, SyncError> {
        let applied = self
            .remote
            .apply_event(entry.event_type, &entry.payload, entry.client_event_id)
            .await
            .and_then(|response| response.rejection().map_or(Ok(()), Err));

        match applied {
            Ok(()) => {
                self.store.outbox_delete(entry.user_id, entry.client_event_id).await?;
                tracing::debug!(client_event_id = %entry.client_event_id, "outbox entry sent");
                Ok(Delivery::Sent)
            }
            Err(e) if e.is_terminal() => {
                self.store.outbox_delete(entry.user_id, entry.client_event_id).await?;
                tracing::info!(
                    client_event_id = %entry.client_event_id,
                    error = %e,
                    "outbox entry discarded after terminal rejection"
                );
                Ok(Delivery::Discarded)
            }
            Err(e) => {
                self.store
                    .outbox_mark_error(entry.user_id, entry.client_event_id, &e.to_string(), Utc::now())
                    .await?;
                tracing::warn!(
                    client_event_id = %entry.client_event_id,
                    attempts = entry.attempt_count + 1,
                    error = %e,
                    "outbox entry failed"
                );
                Ok(Delivery::Failed)
            }
        }
    }
}
