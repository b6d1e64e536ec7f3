//! Edit-permission checks run before an event leaves the device.
//!
//! The remote service enforces the same rules; failing early avoids queueing
//! events that can only be rejected.

use countsync_core::{DomainError, DomainResult};

use crate::derive::Row;
use crate::event::CountEvent;
use crate::model::{Profile, Stage};

/// Whether `profile` may write `stage` on `row` right now.
pub fn can_edit_stage(profile: &Profile, row: &Row, stage: Stage) -> bool {
    ensure_stage_editable(profile, row, stage).is_ok()
}

/// Whether `profile` may resolve the review on `row`.
pub fn can_resolve(profile: &Profile, row: &Row) -> bool {
    profile.role.can_edit() && row.review_pending()
}

/// Check `event` against the caller's role and the current derived row.
pub fn ensure_can_submit(profile: &Profile, event: &CountEvent, row: Option<&Row>) -> DomainResult<()> {
    if !profile.role.can_edit() {
        return Err(DomainError::policy("read-only profile cannot submit counts"));
    }
    let row = row.ok_or_else(DomainError::not_found)?;

    match event {
        CountEvent::CountUpsert(e) => ensure_stage_editable(profile, row, e.stage),
        CountEvent::ReviewResolve(_) => match &row.review {
            Some(review) if !review.is_resolved() => Ok(()),
            Some(_) => Err(DomainError::policy("review already resolved")),
            None => Err(DomainError::policy("no pending review for this item")),
        },
    }
}

fn ensure_stage_editable(profile: &Profile, row: &Row, stage: Stage) -> DomainResult<()> {
    if !profile.role.can_edit() {
        return Err(DomainError::policy("read-only profile cannot submit counts"));
    }
    if row.review.as_ref().is_some_and(|r| r.is_resolved()) {
        return Err(DomainError::policy("item already resolved"));
    }

    match stage {
        Stage::First => {
            if row.second.is_some() {
                return Err(DomainError::policy("stage 1 is locked once stage 2 exists"));
            }
            match &row.first {
                Some(c) if c.counted_by.user_id != profile.user_id => {
                    Err(DomainError::policy("stage 1 can only be edited by its author"))
                }
                _ => Ok(()),
            }
        }
        Stage::Second => {
            let Some(first) = row.first.as_ref() else {
                return Err(DomainError::policy("stage 1 is required before stage 2"));
            };
            if !row.second_eligible() {
                return Err(DomainError::policy("stage 2 only applies to a surplus"));
            }
            match &row.second {
                None if first.counted_by.user_id == profile.user_id => Err(DomainError::policy(
                    "stage 2 requires a different user than stage 1",
                )),
                Some(c) if c.counted_by.user_id != profile.user_id => {
                    Err(DomainError::policy("stage 2 can only be edited by its author"))
                }
                _ => Ok(()),
            }
        }
    }
}
