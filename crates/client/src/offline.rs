//! Connectivity state and forced-offline mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::watch;

pub use crate::types::ConnectivityState;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("client is offline; operation requires network connection")]
    Offline,
}

/// Shared connectivity flag. Clones observe and drive the same state.
#[derive(Debug, Clone)]
pub struct OfflineMode {
    state: Arc<watch::Sender<ConnectivityState>>,
    prefer_offline: Arc<AtomicBool>,
}

impl Default for OfflineMode {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

impl OfflineMode {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
            prefer_offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Returns `true` when the state changed.
    pub fn set(&self, next: ConnectivityState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
        changed
    }

    /// Mark the client as offline.
    pub fn set_offline(&self) -> bool {
        self.set(ConnectivityState::Offline)
    }

    /// Mark the client as online.
    pub fn set_online(&self) -> bool {
        self.set(ConnectivityState::Online)
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    pub fn is_online(&self) -> bool {
        !self.is_offline()
    }

    /// Receive every connectivity transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn prefer_offline(&self) -> bool {
        self.prefer_offline.load(Ordering::SeqCst)
    }

    pub fn set_prefer_offline(&self, prefer: bool) {
        self.prefer_offline.store(prefer, Ordering::SeqCst);
    }

    /// Mutations go to the outbox instead of the remote service.
    pub fn should_queue(&self) -> bool {
        self.is_offline() || self.prefer_offline()
    }

    /// Ensure the client is online; return error if offline.
    pub fn require_online(&self) -> Result<(), OfflineError> {
        if self.is_offline() {
            Err(OfflineError::Offline)
        } else {
            Ok(())
        }
    }
}
