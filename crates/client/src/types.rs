//! Shared value types of the engine.

use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{UserId, WarehouseId};
use countsync_counting::cycle_date_at;
use serde::{Deserialize, Serialize};

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and connected to the remote service.
    Online,
    /// Offline; mutations are queued locally.
    Offline,
}

/// The partition one sync cycle works on: a user's view of one warehouse cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncScope {
    pub user: UserId,
    pub warehouse: WarehouseId,
    pub cycle_date: NaiveDate,
}

impl SyncScope {
    pub fn new(user: UserId, warehouse: WarehouseId, cycle_date: NaiveDate) -> Self {
        Self {
            user,
            warehouse,
            cycle_date,
        }
    }

    /// The same user and warehouse on the cycle in effect at `now`.
    pub fn rolled_to(self, now: DateTime<Utc>, utc_offset_minutes: i32) -> Self {
        Self {
            cycle_date: cycle_date_at(now, utc_offset_minutes),
            ..self
        }
    }
}

/// Counters of one completed sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub manifest_refreshed: bool,
    /// Outbox entries accepted by the remote service.
    pub sent: usize,
    /// Outbox entries dropped after a terminal rejection.
    pub discarded: usize,
    /// Outbox entries left in `error` for a later cycle.
    pub failed: usize,
    /// Entries still in the outbox after the cycle.
    pub pending: usize,
}

/// Result of `sync_now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle was in flight; this trigger was a no-op.
    Skipped,
    Completed(SyncResult),
}

impl SyncOutcome {
    pub fn result(&self) -> Option<&SyncResult> {
        match self {
            SyncOutcome::Skipped => None,
            SyncOutcome::Completed(result) => Some(result),
        }
    }
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted by the remote service and the cache refreshed.
    Applied,
    /// Stored in the outbox and projected onto the cache.
    Queued,
    /// The remote service reported the target as gone or already final.
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn scope_rolls_over_at_local_midnight() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 3, d).unwrap();
        let scope = SyncScope::new(UserId::new(), WarehouseId::new(2), day(10));

        let before = Utc.with_ymd_and_hms(2025, 3, 11, 2, 59, 0).unwrap();
        assert_eq!(scope.rolled_to(before, -180), scope);

        let after = Utc.with_ymd_and_hms(2025, 3, 11, 3, 0, 0).unwrap();
        let next = scope.rolled_to(after, -180);
        assert_eq!(next.cycle_date, day(11));
        assert_eq!((next.user, next.warehouse), (scope.user, scope.warehouse));
    }
}
