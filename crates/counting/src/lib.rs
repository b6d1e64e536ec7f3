//! Two-pass inventory counting domain.
//!
//! This crate contains the counting rules, implemented purely as deterministic
//! domain logic (no IO, no HTTP, no storage): the data model, result
//! classification, row derivation, event payloads, the optimistic projection
//! applied while offline, and the edit-permission policy.

pub mod cycle;
pub mod derive;
pub mod event;
pub mod model;
pub mod overview;
pub mod policy;
pub mod projection;
pub mod result;

#[cfg(test)]
mod fixtures;

pub use cycle::cycle_date_at;
pub use derive::{Row, applicable_review, derive, is_final};
pub use event::{CountEvent, CountUpsert, EventType, ReviewResolve};
pub use model::{
    CountRecord, Counter, ItemKey, ManifestItem, ManifestMeta, Profile, RemoteState,
    ReviewReason, ReviewRecord, ReviewStatus, Role, Stage, ZoneLock, normalize_address,
    normalize_zone,
};
pub use overview::{ZoneOverview, zone_overview, zones};
pub use policy::{can_edit_stage, can_resolve, ensure_can_submit};
pub use projection::project;
pub use result::CountResult;
