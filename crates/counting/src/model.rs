//! Counting data model: manifest, counts, reviews, leases and the cached
//! remote snapshot.

use core::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{DomainError, LockId, UserId, WarehouseId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::CountResult;

/// Zone label used when the source row carries none.
pub const UNZONED: &str = "SEM ZONA";

/// Normalize a zone label (trimmed, upper-cased, never empty).
pub fn normalize_zone(raw: &str) -> String {
    let zone = raw.trim().to_uppercase();
    if zone.is_empty() {
        UNZONED.to_string()
    } else {
        zone
    }
}

/// Normalize an address label (trimmed, upper-cased).
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Counting pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    First,
    Second,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::First => 1,
            Stage::Second => 2,
        }
    }
}

impl TryFrom<u8> for Stage {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Stage::First),
            2 => Ok(Stage::Second),
            other => Err(DomainError::validation(format!("invalid stage {other}"))),
        }
    }
}

impl From<Stage> for u8 {
    fn from(value: Stage) -> Self {
        value.number()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Role of the signed-in user within the counting module.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Auditor,
    Viewer,
}

impl Role {
    /// Whether the role may submit counts and resolve reviews.
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Admin | Role::Auditor)
    }
}

/// Identity stamped on counts, resolutions and leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub user_id: UserId,
    /// Employee badge number ("matrícula").
    pub badge: String,
    pub name: String,
}

/// Signed-in user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub badge: String,
    pub name: String,
    pub role: Role,
    pub default_warehouse: Option<WarehouseId>,
}

impl Profile {
    pub fn counter(&self) -> Counter {
        Counter {
            user_id: self.user_id,
            badge: self.badge.clone(),
            name: self.name.clone(),
        }
    }
}

/// Composite key of a countable slot within one warehouse snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub zone: String,
    pub address: String,
    pub product_code: u64,
}

impl ItemKey {
    pub fn new(zone: &str, address: &str, product_code: u64) -> Self {
        Self {
            zone: normalize_zone(zone),
            address: normalize_address(address),
            product_code,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.zone, self.address, self.product_code)
    }
}

/// One countable slot of the expected-inventory manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestItem {
    pub warehouse: WarehouseId,
    pub zone: String,
    pub address: String,
    pub product_code: u64,
    pub description: String,
    /// Expected quantity ("estoque").
    pub expected_qty: u32,
}

impl ManifestItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.zone, &self.address, self.product_code)
    }
}

/// Snapshot descriptor of a warehouse manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub warehouse: WarehouseId,
    pub row_count: u32,
    pub zone_count: u32,
    /// Content fingerprint ("manifest_hash").
    pub fingerprint: String,
    pub generated_at: DateTime<Utc>,
    pub source_run_id: Option<String>,
}

impl ManifestMeta {
    /// A cached snapshot is stale iff its fingerprint differs from the remote one.
    pub fn is_stale_against(&self, remote: &ManifestMeta) -> bool {
        self.fingerprint != remote.fingerprint
    }
}

/// One counting observation, as confirmed by the server (or projected locally).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecord {
    pub cycle_date: NaiveDate,
    pub warehouse: WarehouseId,
    pub zone: String,
    pub address: String,
    pub product_code: u64,
    pub description: String,
    pub expected_qty: u32,
    pub stage: Stage,
    pub counted_qty: u32,
    pub barcode: Option<String>,
    pub result: CountResult,
    pub counted_by: Counter,
    pub updated_at: DateTime<Utc>,
}

impl CountRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.zone, &self.address, self.product_code)
    }
}

/// Why the server raised a review.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewReason {
    /// The two stages disagree.
    #[serde(rename = "sem_consenso")]
    NoConsensus,
    /// A lease conflict required arbitration.
    #[serde(rename = "conflito_lock")]
    LockConflict,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewStatus {
    #[serde(rename = "pendente")]
    Pending,
    #[serde(rename = "resolvido")]
    Resolved,
}

/// Server-adjudicated review of a disagreement.
///
/// Never created or resolved locally except through the optimistic projection
/// of a queued `review_resolve` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub cycle_date: NaiveDate,
    pub warehouse: WarehouseId,
    pub zone: String,
    pub address: String,
    pub product_code: u64,
    pub description: String,
    pub expected_qty: u32,
    pub reason: ReviewReason,
    /// Opaque copy of the inputs that triggered the review.
    pub snapshot: Value,
    pub status: ReviewStatus,
    pub final_qty: Option<u32>,
    pub final_barcode: Option<String>,
    pub final_result: Option<CountResult>,
    pub resolved_by: Option<Counter>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.zone, &self.address, self.product_code)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ReviewStatus::Resolved
    }
}

/// A time-boxed exclusive claim on (warehouse, cycle, zone, stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneLock {
    pub lock_id: LockId,
    pub cycle_date: NaiveDate,
    pub warehouse: WarehouseId,
    pub zone: String,
    pub stage: Stage,
    pub holder: Counter,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ZoneLock {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether this lease covers the given tuple.
    pub fn covers(&self, warehouse: WarehouseId, cycle_date: NaiveDate, zone: &str, stage: Stage) -> bool {
        self.warehouse == warehouse
            && self.cycle_date == cycle_date
            && self.zone == normalize_zone(zone)
            && self.stage == stage
    }
}

/// Last known server-confirmed state for one (user, warehouse, cycle).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteState {
    pub counts: Vec<CountRecord>,
    pub reviews: Vec<ReviewRecord>,
    pub locks: Vec<ZoneLock>,
    pub server_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_keys_ignore_case_and_padding() {
        assert_eq!(ItemKey::new(" a1 ", "r01-02 ", 7), ItemKey::new("A1", "R01-02", 7));
        assert_eq!(ItemKey::new("", "x", 1).zone, UNZONED);
    }

    #[test]
    fn stage_serializes_as_number() {
        assert_eq!(serde_json::to_value(Stage::Second).unwrap(), serde_json::json!(2));
        assert!(serde_json::from_value::<Stage>(serde_json::json!(3)).is_err());
    }

    #[test]
    fn staleness_is_fingerprint_inequality() {
        let meta = ManifestMeta {
            warehouse: WarehouseId::new(2),
            row_count: 10,
            zone_count: 1,
            fingerprint: "abc".into(),
            generated_at: Utc::now(),
            source_run_id: None,
        };
        let mut remote = meta.clone();
        remote.row_count = 11;
        assert!(!meta.is_stale_against(&remote));
        remote.fingerprint = "abd".into();
        assert!(meta.is_stale_against(&remote));
    }
}
