//! Zone lease lock manager.
//!
//! `UNLOCKED -> ACQUIRING -> HELD -> (RENEWING <-> HELD) -> RELEASED`.
//!
//! A [`ZoneLease`] is a scoped handle: it renews itself on a timer while alive
//! and releases the lease on every exit path. An explicit [`ZoneLease::release`]
//! awaits the remote call; dropping the handle spawns a best-effort release.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use countsync_core::{LockId, WarehouseId};
use countsync_counting::{Stage, ZoneLock, normalize_zone};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::offline::OfflineMode;
use crate::remote::{RejectionCode, RemoteError, RemoteService};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    Renewing,
    Released,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("client is offline; zone leases need a connection")]
    Offline,

    #[error("zone held by another user: {0}")]
    HeldByOther(String),

    #[error(transparent)]
    Remote(RemoteError),
}

impl From<RemoteError> for LockError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Rejected {
                code: RejectionCode::ZoneHeldByOther,
                message,
            } => LockError::HeldByOther(message),
            other => LockError::Remote(other),
        }
    }
}

/// What a lease covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTarget {
    pub warehouse: WarehouseId,
    pub cycle_date: NaiveDate,
    pub zone: String,
    pub stage: Stage,
}

impl LockTarget {
    pub fn new(warehouse: WarehouseId, cycle_date: NaiveDate, zone: &str, stage: Stage) -> Self {
        Self {
            warehouse,
            cycle_date,
            zone: normalize_zone(zone),
            stage,
        }
    }
}

/// Lease timing.
#[derive(Debug, Copy, Clone)]
pub struct LeaseTiming {
    pub ttl: Duration,
    /// Shorter than `ttl`.
    pub heartbeat: Duration,
}

/// Shared observers of one editing session's lease.
#[derive(Debug, Clone)]
struct Signals {
    state: Arc<watch::Sender<LockState>>,
    heartbeat_error: Arc<watch::Sender<Option<String>>>,
}

impl Signals {
    fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(LockState::Unlocked).0),
            heartbeat_error: Arc::new(watch::channel(None).0),
        }
    }

    fn set(&self, state: LockState) {
        self.state.send_replace(state);
    }
}

/// A held zone lease. Renewed in the background until released or dropped.
pub struct ZoneLease {
    target: LockTarget,
    current: Arc<Mutex<ZoneLock>>,
    remote: Arc<dyn RemoteService>,
    signals: Signals,
    heartbeat: Option<JoinHandle<()>>,
}

impl ZoneLease {
    async fn acquire(
        remote: Arc<dyn RemoteService>,
        target: LockTarget,
        timing: LeaseTiming,
        signals: Signals,
    ) -> Result<Self, LockError> {
        signals.set(LockState::Acquiring);
        let acquired = remote
            .acquire_lock(target.warehouse, target.cycle_date, &target.zone, target.stage, timing.ttl)
            .await;
        let lock = match acquired {
            Ok(lock) => lock,
            Err(e) => {
                signals.set(LockState::Unlocked);
                tracing::info!(zone = %target.zone, stage = target.stage.number(), error = %e, "zone lease refused");
                return Err(e.into());
            }
        };

        tracing::info!(
            lock_id = %lock.lock_id,
            zone = %target.zone,
            stage = target.stage.number(),
            expires_at = %lock.expires_at,
            "zone lease acquired"
        );
        signals.heartbeat_error.send_replace(None);
        signals.set(LockState::Held);

        let current = Arc::new(Mutex::new(lock));
        let heartbeat = tokio::spawn(renew_loop(remote.clone(), current.clone(), timing, signals.clone()));
        Ok(Self {
            target,
            current,
            remote,
            signals,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    /// The lease as last confirmed by the remote service.
    pub fn lock(&self) -> Option<ZoneLock> {
        self.current.lock().ok().map(|lock| lock.clone())
    }

    fn lock_id(&self) -> Option<LockId> {
        self.current.lock().ok().map(|lock| lock.lock_id)
    }

    /// Release and wait for the remote answer. Failures are logged, never returned.
    pub async fn release(mut self) -> bool {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        self.signals.set(LockState::Released);
        let Some(lock_id) = self.lock_id() else {
            return false;
        };
        match self.remote.release_lock(lock_id).await {
            Ok(released) => {
                tracing::info!(%lock_id, released, "zone lease released");
                released
            }
            Err(e) => {
                tracing::warn!(%lock_id, error = %e, "zone lease release failed; it will expire");
                false
            }
        }
    }
}

impl Drop for ZoneLease {
    fn drop(&mut self) {
        let Some(task) = self.heartbeat.take() else {
            return;
        };
        task.abort();
        self.signals.set(LockState::Released);

        let Some(lock_id) = self.lock_id() else {
            return;
        };
        let remote = self.remote.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = remote.release_lock(lock_id).await {
                        tracing::warn!(%lock_id, error = %e, "zone lease release failed; it will expire");
                    }
                });
            }
            Err(_) => tracing::warn!(%lock_id, "no runtime to release zone lease; it will expire"),
        }
    }
}

async fn renew_loop(
    remote: Arc<dyn RemoteService>,
    current: Arc<Mutex<ZoneLock>>,
    timing: LeaseTiming,
    signals: Signals,
) {
    if timing.heartbeat.is_zero() {
        tracing::warn!("zero heartbeat interval; zone lease will not be renewed");
        signals
            .heartbeat_error
            .send_replace(Some("heartbeat interval is zero".to_string()));
        return;
    }
    let mut ticker = tokio::time::interval(timing.heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(lock_id) = current.lock().ok().map(|lock| lock.lock_id) else {
            break;
        };

        signals.set(LockState::Renewing);
        match remote.heartbeat_lock(lock_id, timing.ttl).await {
            Ok(renewed) => {
                tracing::debug!(%lock_id, expires_at = %renewed.expires_at, "zone lease renewed");
                if let Ok(mut slot) = current.lock() {
                    *slot = renewed;
                }
                signals.heartbeat_error.send_replace(None);
            }
            Err(e) => {
                // The lease is still believed held; it either renews later or expires server-side.
                tracing::warn!(%lock_id, error = %e, "zone lease heartbeat failed");
                signals.heartbeat_error.send_replace(Some(e.to_string()));
            }
        }
        signals.set(LockState::Held);
    }
}

/// Holds at most one lease for an editing session.
pub struct ZoneLockManager {
    remote: Arc<dyn RemoteService>,
    offline: OfflineMode,
    timing: LeaseTiming,
    signals: Signals,
    current: tokio::sync::Mutex<Option<ZoneLease>>,
}

impl ZoneLockManager {
    pub fn new(remote: Arc<dyn RemoteService>, offline: OfflineMode, timing: LeaseTiming) -> Self {
        Self {
            remote,
            offline,
            timing,
            signals: Signals::new(),
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> LockState {
        *self.signals.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.signals.state.subscribe()
    }

    /// Last heartbeat failure of the current lease, cleared by the next success.
    pub fn subscribe_heartbeat_errors(&self) -> watch::Receiver<Option<String>> {
        self.signals.heartbeat_error.subscribe()
    }

    /// The currently held lease, if any.
    pub async fn current(&self) -> Option<ZoneLock> {
        self.current.lock().await.as_ref().and_then(ZoneLease::lock)
    }

    /// Start editing `target`. A lease on another target is released first.
    pub async fn enter(&self, target: LockTarget) -> Result<ZoneLock, LockError> {
        let mut current = self.current.lock().await;
        if let Some(lease) = current.take() {
            if lease.target == target {
                if let Some(lock) = lease.lock() {
                    *current = Some(lease);
                    return Ok(lock);
                }
            }
            lease.release().await;
        }

        if self.offline.is_offline() {
            self.signals.set(LockState::Unlocked);
            return Err(LockError::Offline);
        }

        let lease = ZoneLease::acquire(self.remote.clone(), target, self.timing, self.signals.clone()).await?;
        let lock = lease.lock();
        *current = Some(lease);
        lock.ok_or_else(|| LockError::Remote(RemoteError::Malformed("lease state unavailable".into())))
    }

    /// Stop editing; returns whether a lease was released remotely.
    pub async fn leave(&self) -> bool {
        match self.current.lock().await.take() {
            Some(lease) => lease.release().await,
            None => false,
        }
    }
}
