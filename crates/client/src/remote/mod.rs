//! Remote reconciliation service seam.
//!
//! The remote service is authoritative: it accepts counts, raises and resolves
//! reviews and grants zone leases. The engine only sees the RPC-shaped
//! operations of [`RemoteService`].

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{ClientEventId, LockId, WarehouseId};
use countsync_counting::{EventType, ManifestItem, ManifestMeta, RemoteState, Stage, ZoneLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[cfg(feature = "http")]
pub mod http;
pub mod memory;
pub mod wire;

pub use memory::{InMemoryBarcodeCatalog, InMemoryRemote, RemoteSession};

/// How the engine reacts to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; fix and resubmit.
    Validation,
    /// Not allowed for this user right now; surfaced, never retried automatically.
    Policy,
    /// The target is gone or already final; a queued event is dropped.
    Terminal,
    /// Retry later.
    Transient,
}

/// Server error tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionCode {
    BarcodeMismatch,
    SecondCountNeedsDifferentUser,
    SecondStageOnlyOnSurplus,
    FirstStageRequired,
    ZoneHeldByOther,
    AdminOnly,
    FirstStageAuthorOnly,
    SecondStageAuthorOnly,
    FirstStageLockedBySecond,
    AlreadyResolved,
    CycleClosed,
    ItemNotFound,
    ReviewNotFound,
    Other(String),
}

const TOKENS: &[(&str, RejectionCode)] = &[
    ("BARRAS_INVALIDA_CODDV", RejectionCode::BarcodeMismatch),
    ("SEGUNDA_CONTAGEM_EXIGE_USUARIO_DIFERENTE", RejectionCode::SecondCountNeedsDifferentUser),
    ("ETAPA2_APENAS_QUANDO_SOBRA", RejectionCode::SecondStageOnlyOnSurplus),
    ("ETAPA1_OBRIGATORIA", RejectionCode::FirstStageRequired),
    ("ZONA_TRAVADA_OUTRO_USUARIO", RejectionCode::ZoneHeldByOther),
    ("APENAS_ADMIN", RejectionCode::AdminOnly),
    ("ETAPA1_APENAS_AUTOR", RejectionCode::FirstStageAuthorOnly),
    ("ETAPA2_APENAS_AUTOR", RejectionCode::SecondStageAuthorOnly),
    ("ETAPA1_BLOQUEADA_SEGUNDA_EXISTE", RejectionCode::FirstStageLockedBySecond),
    ("ITEM_JA_RESOLVIDO", RejectionCode::AlreadyResolved),
    ("CICLO_ENCERRADO", RejectionCode::CycleClosed),
    ("ITEM_NAO_ENCONTRADO", RejectionCode::ItemNotFound),
    ("REVISAO_NAO_ENCONTRADA", RejectionCode::ReviewNotFound),
];

impl RejectionCode {
    /// Find a known token anywhere in a server message.
    pub fn from_message(message: &str) -> Self {
        let upper = message.to_uppercase();
        TOKENS
            .iter()
            .find(|(token, _)| upper.contains(token))
            .map(|(_, code)| code.clone())
            .unwrap_or_else(|| RejectionCode::Other(message.trim().to_string()))
    }

    pub fn token(&self) -> &str {
        match self {
            RejectionCode::Other(raw) => raw,
            known => TOKENS
                .iter()
                .find(|(_, code)| code == known)
                .map(|(token, _)| *token)
                .unwrap_or_default(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RejectionCode::BarcodeMismatch => ErrorClass::Validation,
            RejectionCode::SecondCountNeedsDifferentUser
            | RejectionCode::SecondStageOnlyOnSurplus
            | RejectionCode::FirstStageRequired
            | RejectionCode::ZoneHeldByOther
            | RejectionCode::AdminOnly
            | RejectionCode::FirstStageAuthorOnly
            | RejectionCode::SecondStageAuthorOnly
            | RejectionCode::FirstStageLockedBySecond => ErrorClass::Policy,
            RejectionCode::AlreadyResolved
            | RejectionCode::CycleClosed
            | RejectionCode::ItemNotFound
            | RejectionCode::ReviewNotFound => ErrorClass::Terminal,
            RejectionCode::Other(_) => ErrorClass::Transient,
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The call did not complete (unreachable, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a business rejection.
    #[error("rejected ({code}): {message}")]
    Rejected { code: RejectionCode, message: String },

    /// The response could not be normalized.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Rejected {
            code: RejectionCode::from_message(&message),
            message,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Rejected { code, .. } => code.class(),
            RemoteError::Network(_) | RemoteError::Malformed(_) => ErrorClass::Transient,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}

/// Outcome of `apply_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub accepted: bool,
    /// Free-form status or rejection token.
    pub info: String,
    pub updated_at: DateTime<Utc>,
}

impl ApplyResponse {
    /// Rejection carried in-band by an `accepted = false` answer.
    pub fn rejection(&self) -> Option<RemoteError> {
        (!self.accepted).then(|| RemoteError::rejected(self.info.clone()))
    }
}

/// Operations of the remote reconciliation service, as seen by one signed-in user.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn manifest_meta(&self, warehouse: WarehouseId) -> Result<ManifestMeta, RemoteError>;

    /// One page of the manifest, in a stable order.
    async fn manifest_items_page(
        &self,
        warehouse: WarehouseId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ManifestItem>, RemoteError>;

    async fn sync_pull(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> Result<RemoteState, RemoteError>;

    /// Idempotent on `client_event_id`.
    async fn apply_event(
        &self,
        event_type: EventType,
        payload: &Value,
        client_event_id: ClientEventId,
    ) -> Result<ApplyResponse, RemoteError>;

    async fn acquire_lock(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        zone: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<ZoneLock, RemoteError>;

    async fn heartbeat_lock(&self, lock_id: LockId, ttl: Duration) -> Result<ZoneLock, RemoteError>;

    async fn release_lock(&self, lock_id: LockId) -> Result<bool, RemoteError>;
}

#[async_trait]
impl<S> RemoteService for Arc<S>
where
    S: RemoteService + ?Sized,
{
    async fn manifest_meta(&self, warehouse: WarehouseId) -> Result<ManifestMeta, RemoteError> {
        (**self).manifest_meta(warehouse).await
    }

    async fn manifest_items_page(
        &self,
        warehouse: WarehouseId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ManifestItem>, RemoteError> {
        (**self).manifest_items_page(warehouse, offset, limit).await
    }

    async fn sync_pull(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> Result<RemoteState, RemoteError> {
        (**self).sync_pull(warehouse, cycle_date, since).await
    }

    async fn apply_event(
        &self,
        event_type: EventType,
        payload: &Value,
        client_event_id: ClientEventId,
    ) -> Result<ApplyResponse, RemoteError> {
        (**self).apply_event(event_type, payload, client_event_id).await
    }

    async fn acquire_lock(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        zone: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<ZoneLock, RemoteError> {
        (**self).acquire_lock(warehouse, cycle_date, zone, stage, ttl).await
    }

    async fn heartbeat_lock(&self, lock_id: LockId, ttl: Duration) -> Result<ZoneLock, RemoteError> {
        (**self).heartbeat_lock(lock_id, ttl).await
    }

    async fn release_lock(&self, lock_id: LockId) -> Result<bool, RemoteError> {
        (**self).release_lock(lock_id).await
    }
}

/// Barcode-to-product lookup used to validate surplus counts.
#[async_trait]
pub trait BarcodeCatalog: Send + Sync {
    /// Product code registered for `barcode`, if known.
    async fn product_for(&self, barcode: &str) -> Result<Option<u64>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_found_inside_server_messages() {
        let code = RejectionCode::from_message("P0001: ciclo_encerrado para cd 2");
        assert_eq!(code, RejectionCode::CycleClosed);
        assert_eq!(code.class(), ErrorClass::Terminal);
        assert_eq!(code.token(), "CICLO_ENCERRADO");
    }

    #[test]
    fn classes_follow_the_taxonomy() {
        assert_eq!(RejectionCode::from_message("BARRAS_INVALIDA_CODDV").class(), ErrorClass::Validation);
        assert_eq!(RejectionCode::from_message("ZONA_TRAVADA_OUTRO_USUARIO").class(), ErrorClass::Policy);
        assert_eq!(RejectionCode::from_message("ITEM_JA_RESOLVIDO").class(), ErrorClass::Terminal);
        assert_eq!(RejectionCode::from_message("deadlock detected").class(), ErrorClass::Transient);
        assert_eq!(RemoteError::Network("down".into()).class(), ErrorClass::Transient);
    }

    #[test]
    fn unaccepted_responses_carry_their_rejection() {
        let response = ApplyResponse {
            accepted: false,
            info: "REVISAO_NAO_ENCONTRADA".into(),
            updated_at: Utc::now(),
        };
        assert!(response.rejection().is_some_and(|e| e.is_terminal()));
    }
}
