//! Row derivation: merges the manifest with the latest known remote state.
//!
//! Pure and deterministic. Inputs are borrowed and never mutated; calling
//! [`derive`] twice with the same inputs yields the same rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{CountRecord, ItemKey, ManifestItem, RemoteState, ReviewReason, ReviewRecord, Stage};
use crate::result::CountResult;

/// Per-item view consumed by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub item: ManifestItem,
    pub key: ItemKey,
    pub first: Option<CountRecord>,
    pub second: Option<CountRecord>,
    /// The applicable review, if any.
    pub review: Option<ReviewRecord>,
    /// Closed and immutable in the UI.
    pub is_final: bool,
}

impl Row {
    pub fn count(&self, stage: Stage) -> Option<&CountRecord> {
        match stage {
            Stage::First => self.first.as_ref(),
            Stage::Second => self.second.as_ref(),
        }
    }

    pub fn awaits_first(&self) -> bool {
        self.first.is_none()
    }

    /// Stage 1 found a surplus, so a second independent count is required.
    pub fn second_eligible(&self) -> bool {
        self.first
            .as_ref()
            .is_some_and(|c| c.result == CountResult::Surplus)
    }

    pub fn awaits_second(&self) -> bool {
        self.second_eligible() && self.second.is_none() && self.review.is_none()
    }

    pub fn review_pending(&self) -> bool {
        self.review.as_ref().is_some_and(|r| !r.is_resolved())
    }
}

/// Derive one row per manifest item, in manifest order.
pub fn derive(manifest: &[ManifestItem], remote: &RemoteState) -> Vec<Row> {
    let mut counts: HashMap<ItemKey, (Option<&CountRecord>, Option<&CountRecord>)> = HashMap::new();
    for count in &remote.counts {
        let slot = counts.entry(count.key()).or_default();
        match count.stage {
            Stage::First => slot.0 = Some(count),
            Stage::Second => slot.1 = Some(count),
        }
    }

    let mut reviews: HashMap<ItemKey, &ReviewRecord> = HashMap::new();
    for review in &remote.reviews {
        reviews.insert(review.key(), review);
    }

    manifest
        .iter()
        .map(|item| {
            let key = item.key();
            let (first, second) = counts.get(&key).copied().unwrap_or((None, None));
            let review = reviews
                .get(&key)
                .copied()
                .and_then(|r| applicable_review(r, first, second));
            let is_final = is_final(first, second, review);

            Row {
                item: item.clone(),
                key,
                first: first.cloned(),
                second: second.cloned(),
                review: review.cloned(),
                is_final,
            }
        })
        .collect()
}

/// Filter a review by whether it still applies to the current counts.
///
/// Resolved reviews always apply. A pending review whose triggering
/// disagreement no longer exists is ignored.
pub fn applicable_review<'a>(
    review: &'a ReviewRecord,
    first: Option<&CountRecord>,
    second: Option<&CountRecord>,
) -> Option<&'a ReviewRecord> {
    if review.is_resolved() {
        return Some(review);
    }

    let disagree = |a: &CountRecord, b: &CountRecord| {
        !a.result.is_discarded() && !b.result.is_discarded() && a.counted_qty != b.counted_qty
    };

    let applies = match review.reason {
        ReviewReason::NoConsensus => match (first, second) {
            (Some(a), Some(b)) => disagree(a, b),
            _ => false,
        },
        ReviewReason::LockConflict => match (first, second) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => disagree(a, b),
            (Some(a), None) => a.result.is_surplus(),
            (None, None) => false,
        },
    };

    applies.then_some(review)
}

/// Finality, evaluated in order:
/// 1. resolved review,
/// 2. either stage discarded,
/// 3. both stages present with equal quantities,
/// 4. stage 1 present, not a surplus, and no review,
/// 5. otherwise not final.
pub fn is_final(
    first: Option<&CountRecord>,
    second: Option<&CountRecord>,
    review: Option<&ReviewRecord>,
) -> bool {
    if review.is_some_and(|r| r.is_resolved()) {
        return true;
    }
    if first.is_some_and(|c| c.result.is_discarded()) || second.is_some_and(|c| c.result.is_discarded()) {
        return true;
    }
    if let (Some(a), Some(b)) = (first, second) {
        if a.counted_qty == b.counted_qty {
            return true;
        }
    }
    if let Some(a) = first {
        if !a.result.is_surplus() && review.is_none() {
            return true;
        }
    }
    false
}
