//! Builders shared by the unit tests of this crate.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use countsync_core::{UserId, WarehouseId};
use serde_json::json;

use crate::model::{
    CountRecord, Counter, ManifestItem, Profile, ReviewReason, ReviewRecord, ReviewStatus, Role,
    Stage,
};
use crate::result::CountResult;

pub fn cycle() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, hour, 0, 0).unwrap()
}

pub fn warehouse() -> WarehouseId {
    WarehouseId::new(2)
}

pub fn profile(name: &str, role: Role) -> Profile {
    Profile {
        user_id: UserId::new(),
        badge: format!("{}-001", name.to_uppercase()),
        name: name.to_string(),
        role,
        default_warehouse: Some(warehouse()),
    }
}

pub fn counter(name: &str) -> Counter {
    profile(name, Role::Auditor).counter()
}

pub fn item(zone: &str, address: &str, product_code: u64, expected_qty: u32) -> ManifestItem {
    ManifestItem {
        warehouse: warehouse(),
        zone: zone.to_string(),
        address: address.to_string(),
        product_code,
        description: format!("PRODUCT {product_code}"),
        expected_qty,
    }
}

pub fn count_by(item: &ManifestItem, stage: Stage, qty: u32, discarded: bool, by: &Counter) -> CountRecord {
    let result = CountResult::classify(item.expected_qty, qty, discarded);
    CountRecord {
        cycle_date: cycle(),
        warehouse: item.warehouse,
        zone: item.zone.clone(),
        address: item.address.clone(),
        product_code: item.product_code,
        description: item.description.clone(),
        expected_qty: item.expected_qty,
        stage,
        counted_qty: if discarded { 0 } else { qty },
        barcode: (result == CountResult::Surplus).then(|| format!("789{}", item.product_code)),
        result,
        counted_by: by.clone(),
        updated_at: at(9),
    }
}

pub fn count(item: &ManifestItem, stage: Stage, qty: u32, discarded: bool) -> CountRecord {
    count_by(item, stage, qty, discarded, &counter("ana"))
}

pub fn review(item: &ManifestItem, reason: ReviewReason, status: ReviewStatus) -> ReviewRecord {
    let resolved = status == ReviewStatus::Resolved;
    ReviewRecord {
        cycle_date: cycle(),
        warehouse: item.warehouse,
        zone: item.zone.clone(),
        address: item.address.clone(),
        product_code: item.product_code,
        description: item.description.clone(),
        expected_qty: item.expected_qty,
        reason,
        snapshot: json!({ "estoque": item.expected_qty }),
        status,
        final_qty: resolved.then_some(item.expected_qty),
        final_barcode: None,
        final_result: resolved.then_some(CountResult::Correct),
        resolved_by: resolved.then(|| counter("rita")),
        resolved_at: resolved.then(|| at(11)),
        updated_at: at(10),
    }
}
