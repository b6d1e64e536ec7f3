//! Optimistic event applier.
//!
//! Online, an event goes straight to the remote service and the cache is
//! refreshed from a pull. Offline (or in forced-offline mode) it is appended to
//! the outbox and projected onto the cached remote state so derived rows show it
//! at once.

use std::sync::Arc;

use chrono::Utc;
use countsync_core::{ClientEventId, DomainError};
use countsync_counting::{CountEvent, Profile, RemoteState, Row, derive, ensure_can_submit, project};
use thiserror::Error;
use tokio::sync::watch;

use crate::offline::OfflineMode;
use crate::remote::{BarcodeCatalog, ErrorClass, RemoteError, RemoteService};
use crate::store::{LocalStore, PendingEvent, StoreError};
use crate::types::{SubmitOutcome, SyncScope};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SubmitError::Domain(DomainError::Policy(_)) => ErrorClass::Policy,
            SubmitError::Domain(_) => ErrorClass::Validation,
            SubmitError::Remote(e) => e.class(),
            SubmitError::Store(_) => ErrorClass::Transient,
        }
    }
}

/// Number of outbox entries of the active scope, observable by the UI.
#[derive(Debug, Clone)]
pub struct PendingIndicator {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for PendingIndicator {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl PendingIndicator {
    pub fn get(&self) -> usize {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }

    pub fn set(&self, count: usize) {
        self.tx.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    /// Recount the outbox of `scope` and publish the result.
    pub async fn refresh(&self, store: &LocalStore, scope: SyncScope) -> Result<usize, StoreError> {
        let count = store.outbox_count(scope.user, scope.warehouse, scope.cycle_date).await?;
        self.set(count);
        Ok(count)
    }
}

pub struct EventApplier {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    catalog: Option<Arc<dyn BarcodeCatalog>>,
    offline: OfflineMode,
    pending: PendingIndicator,
}

impl EventApplier {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        offline: OfflineMode,
        pending: PendingIndicator,
    ) -> Self {
        Self {
            store,
            remote,
            catalog: None,
            offline,
            pending,
        }
    }

    /// Verify surplus barcodes against `catalog` before submitting.
    pub fn with_barcode_catalog(mut self, catalog: Arc<dyn BarcodeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Validate, authorize and then send or queue `event` as `profile`.
    ///
    /// Validation and policy failures happen before any remote call or outbox
    /// write. Online failures other than a terminal rejection are returned
    /// without queueing.
    pub async fn submit(&self, profile: &Profile, event: CountEvent) -> Result<SubmitOutcome, SubmitError> {
        let scope = SyncScope::new(profile.user_id, event.warehouse(), event.cycle_date());
        let manifest = self.store.manifest_items(scope.user, scope.warehouse).await?;
        let cached = self
            .store
            .remote_state(scope.user, scope.warehouse, scope.cycle_date)
            .await?
            .unwrap_or_default();
        let rows = derive(&manifest, &cached);

        let event = event.normalized();
        let key = event.key();
        let row = rows.iter().find(|row| row.key == key);
        let event = match row {
            Some(row) => aligned_with_manifest(event, row),
            None => event,
        };

        event.validate_shape()?;
        ensure_can_submit(profile, &event, row)?;
        self.verify_barcode(&event).await?;

        if self.offline.should_queue() {
            return self.enqueue(profile, scope, &event, cached).await;
        }

        let payload = event.to_payload()?;
        let id = ClientEventId::new();
        let applied = self
            .remote
            .apply_event(event.event_type(), &payload, id)
            .await
            .and_then(|response| response.rejection().map_or(Ok(()), Err));

        let outcome = match applied {
            Ok(()) => {
                tracing::info!(client_event_id = %id, event_type = %event.event_type(), "event applied");
                SubmitOutcome::Applied
            }
            Err(e) if e.is_terminal() => {
                tracing::info!(client_event_id = %id, error = %e, "event discarded by remote service");
                SubmitOutcome::Discarded
            }
            Err(e) => {
                tracing::warn!(client_event_id = %id, error = %e, "event rejected");
                return Err(e.into());
            }
        };

        match self.remote.sync_pull(scope.warehouse, scope.cycle_date, None).await {
            Ok(state) => {
                self.store
                    .put_remote_state(scope.user, scope.warehouse, scope.cycle_date, &state)
                    .await?;
            }
            Err(e) if outcome == SubmitOutcome::Applied => {
                tracing::warn!(error = %e, "pull after apply failed; projecting locally");
                let next = project(&cached, &event, &profile.counter(), Utc::now());
                self.store
                    .put_remote_state(scope.user, scope.warehouse, scope.cycle_date, &next)
                    .await?;
            }
            Err(e) => tracing::warn!(error = %e, "pull after discard failed"),
        }

        self.pending.refresh(&self.store, scope).await?;
        Ok(outcome)
    }

    async fn enqueue(
        &self,
        profile: &Profile,
        scope: SyncScope,
        event: &CountEvent,
        cached: RemoteState,
    ) -> Result<SubmitOutcome, SubmitError> {
        let now = Utc::now();
        let pending = PendingEvent::new(profile.user_id, event, now)?;
        self.store.outbox_put(&pending).await?;

        let next = project(&cached, event, &profile.counter(), now);
        self.store
            .put_remote_state(scope.user, scope.warehouse, scope.cycle_date, &next)
            .await?;

        let count = self.pending.refresh(&self.store, scope).await?;
        tracing::info!(
            client_event_id = %pending.client_event_id,
            event_type = %event.event_type(),
            pending = count,
            "event queued"
        );
        Ok(SubmitOutcome::Queued)
    }

    async fn verify_barcode(&self, event: &CountEvent) -> Result<(), SubmitError> {
        let (Some(catalog), Some(barcode)) = (&self.catalog, event.barcode_to_verify()) else {
            return Ok(());
        };
        let expected = event.key().product_code;
        match catalog.product_for(&barcode).await {
            Ok(Some(code)) if code == expected => Ok(()),
            Ok(Some(code)) => Err(DomainError::validation(format!(
                "barcode {barcode} belongs to product {code}, not {expected}"
            ))
            .into()),
            Ok(None) => Err(DomainError::validation(format!("barcode {barcode} is not registered")).into()),
            Err(e) if self.offline.should_queue() => {
                tracing::warn!(error = %e, "barcode catalog unavailable; check deferred to the server");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The manifest is authoritative for expected quantity and description.
fn aligned_with_manifest(event: CountEvent, row: &Row) -> CountEvent {
    match event {
        CountEvent::CountUpsert(mut e) => {
            e.expected_qty = row.item.expected_qty;
            if e.description.trim().is_empty() {
                e.description = row.item.description.clone();
            }
            CountEvent::CountUpsert(e).normalized()
        }
        CountEvent::ReviewResolve(mut e) => {
            e.expected_qty = row.item.expected_qty;
            CountEvent::ReviewResolve(e).normalized()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countsync_core::{UserId, WarehouseId};
    use countsync_counting::{CountUpsert, ManifestItem, ManifestMeta, Role, Stage};
    use chrono::NaiveDate;

    use crate::remote::{InMemoryBarcodeCatalog, InMemoryRemote};

    fn profile(name: &str, role: Role) -> Profile {
        Profile {
            user_id: UserId::new(),
            badge: name.to_uppercase(),
            name: name.into(),
            role,
            default_warehouse: None,
        }
    }

    fn cycle() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn item() -> ManifestItem {
        ManifestItem {
            warehouse: WarehouseId::new(2),
            zone: "A".into(),
            address: "R1".into(),
            product_code: 5,
            description: "P5".into(),
            expected_qty: 10,
        }
    }

    async fn seeded(user: UserId) -> LocalStore {
        let store = LocalStore::in_memory();
        let meta = ManifestMeta {
            warehouse: WarehouseId::new(2),
            row_count: 1,
            zone_count: 1,
            fingerprint: "h".into(),
            generated_at: Utc::now(),
            source_run_id: None,
        };
        store.manifest_replace(user, &meta, &[item()]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn offline_submit_queues_and_projects() {
        let ana = profile("ana", Role::Auditor);
        let store = seeded(ana.user_id).await;
        let server = InMemoryRemote::new();
        let offline = OfflineMode::default();
        offline.set_offline();
        let pending = PendingIndicator::default();
        let applier = EventApplier::new(store.clone(), Arc::new(server.as_user(&ana)), offline, pending.clone());

        let event = CountUpsert::for_item(&item(), cycle(), Stage::First, 10).into();
        assert_eq!(applier.submit(&ana, event).await.unwrap(), SubmitOutcome::Queued);
        assert_eq!(pending.get(), 1);

        let cached = store.remote_state(ana.user_id, WarehouseId::new(2), cycle()).await.unwrap().unwrap();
        assert!(derive(&[item()], &cached)[0].is_final);
        assert_eq!(server.effect_count(), 0);
    }

    #[tokio::test]
    async fn viewer_is_rejected_before_anything_is_written() {
        let viewer = profile("vera", Role::Viewer);
        let store = seeded(viewer.user_id).await;
        let server = InMemoryRemote::new();
        let offline = OfflineMode::default();
        offline.set_offline();
        let applier =
            EventApplier::new(store.clone(), Arc::new(server.as_user(&viewer)), offline, PendingIndicator::default());

        let event = CountUpsert::for_item(&item(), cycle(), Stage::First, 3).into();
        let err = applier.submit(&viewer, event).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Policy);
        assert_eq!(store.outbox_count(viewer.user_id, WarehouseId::new(2), cycle()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn foreign_barcode_fails_validation() {
        let ana = profile("ana", Role::Auditor);
        let store = seeded(ana.user_id).await;
        let server = InMemoryRemote::new();
        let catalog = Arc::new(InMemoryBarcodeCatalog::new().with("789", 99));
        let applier = EventApplier::new(
            store,
            Arc::new(server.as_user(&ana)),
            OfflineMode::default(),
            PendingIndicator::default(),
        )
        .with_barcode_catalog(catalog);

        let event = CountUpsert::for_item(&item(), cycle(), Stage::First, 12).with_barcode("789").into();
        let err = applier.submit(&ana, event).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(server.apply_log().is_empty());
    }
}
