//! Offline-first inventory counting engine.
//!
//! Counts are recorded against a cached manifest, projected locally while
//! offline, queued in a durable outbox, and reconciled with the remote service
//! by an ordered push-then-pull sync cycle. Zone leases keep two counters out of
//! the same zone and stage.

pub mod applier;
pub mod config;
pub mod lock;
pub mod offline;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync_manager;
pub mod sync_worker;
pub mod types;

pub use applier::{EventApplier, PendingIndicator, SubmitError};
pub use config::{EngineConfig, StoreLocation};
pub use lock::{LeaseTiming, LockError, LockState, LockTarget, ZoneLease, ZoneLockManager};
pub use offline::{ConnectivityState, OfflineError, OfflineMode};
pub use remote::{
    ApplyResponse, BarcodeCatalog, ErrorClass, InMemoryBarcodeCatalog, InMemoryRemote, RejectionCode, RemoteError,
    RemoteService, RemoteSession,
};
pub use session::{CountingSession, SessionError};
pub use store::{LocalStore, OutboxStatus, PendingEvent, Preferences, StoreError, StoreResult};
pub use sync_manager::{SyncError, SyncOrchestrator};
pub use sync_worker::{SyncWorker, WorkerHandle};
pub use types::{SubmitOutcome, SyncOutcome, SyncResult, SyncScope};
