//! Optimistic projection of a queued event onto the cached remote state.
//!
//! Uses the same classification as the server so the derived row does not
//! change when the event is later confirmed and pulled back.

use chrono::{DateTime, Utc};

use crate::event::{CountEvent, CountUpsert, ReviewResolve};
use crate::model::{CountRecord, Counter, ItemKey, RemoteState, ReviewStatus};

/// Apply `event` as `actor` would see it confirmed at `now`.
///
/// The previous state is left untouched. A resolution for a review that is not
/// cached only advances `server_time`.
pub fn project(previous: &RemoteState, event: &CountEvent, actor: &Counter, now: DateTime<Utc>) -> RemoteState {
    let mut next = previous.clone();
    match event.normalized() {
        CountEvent::CountUpsert(e) => project_count(&mut next, e, actor, now),
        CountEvent::ReviewResolve(e) => project_resolution(&mut next, e, actor, now),
    }
    next.server_time = Some(now);
    next
}

fn project_count(state: &mut RemoteState, e: CountUpsert, actor: &Counter, now: DateTime<Utc>) {
    let key = ItemKey::new(&e.zone, &e.address, e.product_code);
    state.counts.retain(|c| {
        !(c.cycle_date == e.cycle_date && c.warehouse == e.warehouse && c.stage == e.stage && c.key() == key)
    });

    let result = e.result();
    let description = if e.description.trim().is_empty() {
        format!("CODDV {}", e.product_code)
    } else {
        e.description
    };
    state.counts.push(CountRecord {
        cycle_date: e.cycle_date,
        warehouse: e.warehouse,
        zone: key.zone,
        address: key.address,
        product_code: e.product_code,
        description,
        expected_qty: e.expected_qty,
        stage: e.stage,
        counted_qty: e.counted_qty,
        barcode: e.barcode,
        result,
        counted_by: actor.clone(),
        updated_at: now,
    });
}

fn project_resolution(state: &mut RemoteState, e: ReviewResolve, actor: &Counter, now: DateTime<Utc>) {
    let key = ItemKey::new(&e.zone, &e.address, e.product_code);
    let result = e.result();
    if let Some(review) = state
        .reviews
        .iter_mut()
        .find(|r| r.cycle_date == e.cycle_date && r.warehouse == e.warehouse && r.key() == key)
    {
        review.status = ReviewStatus::Resolved;
        review.final_qty = Some(e.final_qty);
        review.final_barcode = e.final_barcode;
        review.final_result = Some(result);
        review.resolved_by = Some(actor.clone());
        review.resolved_at = Some(now);
        review.updated_at = now;
    }
}
