//! Composition root for one signed-in user.
//!
//! Owns the store handle, the remote service, connectivity, the applier, the
//! orchestrator and the lock manager. Components never reach for globals; they
//! get the pieces they need from here.

use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use countsync_core::WarehouseId;
use countsync_counting::{
    CountEvent, Profile, Row, Stage, ZoneLock, ZoneOverview, cycle_date_at, derive, normalize_zone, zone_overview,
    zones,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::applier::{EventApplier, PendingIndicator, SubmitError};
use crate::config::EngineConfig;
use crate::lock::{LeaseTiming, LockError, LockState, LockTarget, ZoneLockManager};
use crate::offline::{ConnectivityState, OfflineMode};
use crate::remote::{BarcodeCatalog, RemoteService};
use crate::store::{LocalStore, Preferences, StoreError};
use crate::sync_manager::{SyncError, SyncOrchestrator};
use crate::sync_worker::{SyncWorker, WorkerHandle};
use crate::types::{SubmitOutcome, SyncOutcome, SyncScope};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active warehouse selected")]
    NoWarehouse,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

pub struct CountingSession {
    config: EngineConfig,
    profile: Profile,
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    offline: OfflineMode,
    pending: PendingIndicator,
    applier: EventApplier,
    orchestrator: Arc<SyncOrchestrator>,
    locks: ZoneLockManager,
    scope: watch::Sender<Option<SyncScope>>,
}

impl CountingSession {
    /// Open a session: load preferences and restore the active warehouse.
    pub async fn open(config: EngineConfig, profile: Profile, remote: Arc<dyn RemoteService>) -> anyhow::Result<Self> {
        config.validate()?;
        let store = LocalStore::new(config.store.clone());
        let prefs = store
            .preferences(profile.user_id)
            .await
            .context("failed to load preferences")?;

        let offline = OfflineMode::default();
        offline.set_prefer_offline(prefs.prefer_offline);
        let pending = PendingIndicator::default();

        let applier = EventApplier::new(store.clone(), remote.clone(), offline.clone(), pending.clone());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), remote.clone(), offline.clone(), pending.clone())
                .with_page_size(config.manifest_page_size),
        );
        let locks = ZoneLockManager::new(
            remote.clone(),
            offline.clone(),
            LeaseTiming {
                ttl: config.lock_ttl,
                heartbeat: config.lock_heartbeat,
            },
        );

        let session = Self {
            config,
            profile,
            store,
            remote,
            offline,
            pending,
            applier,
            orchestrator,
            locks,
            scope: watch::channel(None).0,
        };

        if let Some(warehouse) = prefs.active_warehouse.or(session.profile.default_warehouse) {
            session
                .select_warehouse(warehouse)
                .await
                .context("failed to restore active warehouse")?;
        }
        tracing::info!(user = %session.profile.user_id, role = ?session.profile.role, "counting session opened");
        Ok(session)
    }

    /// Open a session against the HTTP RPC service configured in `config`.
    #[cfg(feature = "http")]
    pub async fn connect(config: EngineConfig, profile: Profile, access_token: &str) -> anyhow::Result<Self> {
        let remote = crate::remote::http::HttpRemote::from_config(&config)
            .context("COUNTSYNC_API_URL is not configured")?
            .with_token(access_token);
        Self::open(config, profile, Arc::new(remote)).await
    }

    /// Verify surplus barcodes against `catalog` before submitting.
    pub fn with_barcode_catalog(mut self, catalog: Arc<dyn BarcodeCatalog>) -> Self {
        self.applier = EventApplier::new(
            self.store.clone(),
            self.remote.clone(),
            self.offline.clone(),
            self.pending.clone(),
        )
        .with_barcode_catalog(catalog);
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn offline(&self) -> &OfflineMode {
        &self.offline
    }

    /// Today's counting cycle at the configured UTC offset.
    pub fn cycle_date(&self) -> NaiveDate {
        cycle_date_at(Utc::now(), self.config.cycle_utc_offset_minutes)
    }

    /// The active scope on today's cycle; a selection carries over local midnight.
    pub fn scope(&self) -> Option<SyncScope> {
        let scope = (*self.scope.borrow())?;
        Some(scope.rolled_to(Utc::now(), self.config.cycle_utc_offset_minutes))
    }

    fn require_scope(&self) -> Result<SyncScope, SessionError> {
        self.scope().ok_or(SessionError::NoWarehouse)
    }

    /// Make `warehouse` the active one, persist the choice and trigger a sync.
    pub async fn select_warehouse(&self, warehouse: WarehouseId) -> Result<SyncScope, SessionError> {
        let scope = SyncScope::new(self.profile.user_id, warehouse, self.cycle_date());
        if self.scope().is_some_and(|current| current.warehouse != warehouse) {
            self.locks.leave().await;
        }

        let prefs = Preferences {
            active_warehouse: Some(warehouse),
            prefer_offline: self.offline.prefer_offline(),
        };
        self.store.put_preferences(self.profile.user_id, prefs).await?;
        self.pending.refresh(&self.store, scope).await?;
        self.scope.send_replace(Some(scope));
        tracing::info!(cd = %warehouse, cycle = %scope.cycle_date, "active warehouse selected");
        Ok(scope)
    }

    /// Derived rows of the active scope, in manifest order.
    pub async fn rows(&self) -> Result<Vec<Row>, SessionError> {
        let scope = self.require_scope()?;
        let manifest = self.store.manifest_items(scope.user, scope.warehouse).await?;
        let remote = self
            .store
            .remote_state(scope.user, scope.warehouse, scope.cycle_date)
            .await?
            .unwrap_or_default();
        Ok(derive(&manifest, &remote))
    }

    pub async fn rows_in_zone(&self, zone: &str) -> Result<Vec<Row>, SessionError> {
        let zone = normalize_zone(zone);
        let mut rows = self.rows().await?;
        rows.retain(|row| row.key.zone == zone);
        Ok(rows)
    }

    pub async fn zones(&self) -> Result<Vec<String>, SessionError> {
        Ok(zones(&self.rows().await?))
    }

    pub async fn zone_overview(&self) -> Result<Vec<ZoneOverview>, SessionError> {
        Ok(zone_overview(&self.rows().await?))
    }

    pub async fn submit(&self, event: CountEvent) -> Result<SubmitOutcome, SubmitError> {
        self.applier.submit(&self.profile, event).await
    }

    pub async fn sync_now(&self, force_manifest: bool) -> Result<SyncOutcome, SessionError> {
        let scope = self.require_scope()?;
        Ok(self.orchestrator.sync_now(scope, force_manifest).await?)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.get()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Outbox entries of the active warehouse that failed at least once.
    pub async fn error_count(&self) -> Result<usize, SessionError> {
        let scope = self.require_scope()?;
        Ok(self.store.outbox_error_count(scope.user, scope.warehouse).await?)
    }

    /// Report connectivity; going online wakes the background worker.
    pub fn set_connectivity(&self, state: ConnectivityState) -> bool {
        self.offline.set(state)
    }

    pub async fn set_prefer_offline(&self, prefer: bool) -> Result<(), SessionError> {
        self.offline.set_prefer_offline(prefer);
        let prefs = Preferences {
            active_warehouse: self.scope().map(|scope| scope.warehouse),
            prefer_offline: prefer,
        };
        self.store.put_preferences(self.profile.user_id, prefs).await?;
        Ok(())
    }

    /// Lease `zone` at `stage` in the active scope; any other lease is released first.
    pub async fn enter_zone(&self, zone: &str, stage: Stage) -> Result<ZoneLock, SessionError> {
        let scope = self.require_scope()?;
        let target = LockTarget::new(scope.warehouse, scope.cycle_date, zone, stage);
        Ok(self.locks.enter(target).await?)
    }

    pub async fn leave_zone(&self) -> bool {
        self.locks.leave().await
    }

    pub fn lock_state(&self) -> LockState {
        self.locks.state()
    }

    pub fn subscribe_lock_state(&self) -> watch::Receiver<LockState> {
        self.locks.subscribe()
    }

    /// Start the background worker for this session.
    pub fn spawn_worker(&self) -> WorkerHandle {
        SyncWorker::new(
            self.orchestrator.clone(),
            self.offline.clone(),
            self.scope.subscribe(),
            self.config.sync_interval,
        )
        .with_cycle_offset(self.config.cycle_utc_offset_minutes)
        .start()
    }

    /// Release any lease and wipe every local record of the user.
    pub async fn logout(self) -> Result<(), SessionError> {
        self.locks.leave().await;
        self.store.clear_user(self.profile.user_id).await?;
        self.store.close().await;
        tracing::info!(user = %self.profile.user_id, "session closed and local data cleared");
        Ok(())
    }
}
