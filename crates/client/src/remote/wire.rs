//! Normalization boundary between loosely typed RPC responses and the model.
//!
//! Every field has a fallback. Rows that cannot be keyed (no warehouse, no
//! address, no product code) and leases without a valid id are dropped. A
//! response whose overall shape is wrong is `RemoteError::Malformed`.

use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{LockId, UserId, WarehouseId};
use countsync_counting::{
    CountRecord, CountResult, Counter, ManifestItem, ManifestMeta, RemoteState, ReviewReason, ReviewRecord,
    ReviewStatus, Stage, ZoneLock, normalize_address, normalize_zone,
};
use serde_json::{Map, Value};

use super::{ApplyResponse, RemoteError};

type Object = Map<String, Value>;

/// Integer from a number or numeric string.
fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn non_negative(value: Option<&Value>) -> u32 {
    int(value).map(|n| n.clamp(0, i64::from(u32::MAX)) as u32).unwrap_or(0)
}

fn string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    }
}

fn nullable_string(value: Option<&Value>) -> Option<String> {
    let s = string(value);
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn boolean(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        other => matches!(string(other).trim().to_lowercase().as_str(), "true" | "t" | "1"),
    }
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = nullable_string(value)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn date(value: Option<&Value>) -> Option<NaiveDate> {
    let raw = nullable_string(value)?;
    raw.get(..10)?.parse().ok()
}

fn result(value: Option<&Value>) -> CountResult {
    string(value).parse().unwrap_or(CountResult::Correct)
}

fn stage(value: Option<&Value>) -> Stage {
    if int(value) == Some(2) { Stage::Second } else { Stage::First }
}

fn review_status(value: Option<&Value>) -> ReviewStatus {
    if string(value).trim().eq_ignore_ascii_case("resolvido") {
        ReviewStatus::Resolved
    } else {
        ReviewStatus::Pending
    }
}

fn review_reason(value: Option<&Value>) -> ReviewReason {
    if string(value).trim().eq_ignore_ascii_case("conflito_lock") {
        ReviewReason::LockConflict
    } else {
        ReviewReason::NoConsensus
    }
}

fn warehouse(value: Option<&Value>) -> Option<WarehouseId> {
    int(value)
        .filter(|&cd| cd > 0)
        .and_then(|cd| u32::try_from(cd).ok())
        .map(WarehouseId::new)
}

fn product_code(value: Option<&Value>) -> Option<u64> {
    int(value).filter(|&code| code > 0).and_then(|code| u64::try_from(code).ok())
}

fn user(value: Option<&Value>) -> UserId {
    nullable_string(value)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| UserId::from_uuid(uuid::Uuid::nil()))
}

fn counter(raw: &Object, id: &str, badge: &str, name: &str) -> Counter {
    Counter {
        user_id: user(raw.get(id)),
        badge: string(raw.get(badge)),
        name: string(raw.get(name)),
    }
}

/// RPC results are set-returning; take the first row of an array, or the object itself.
pub fn first_row(data: &Value) -> Option<&Object> {
    match data {
        Value::Array(rows) => rows.first().and_then(Value::as_object),
        Value::Object(obj) => Some(obj),
        _ => None,
    }
}

fn rows(value: Option<&Value>) -> impl Iterator<Item = &Object> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// A list field that may be absent or null, but must be an array when present.
fn list<'a>(raw: &'a Object, key: &str) -> Result<impl Iterator<Item = &'a Object> + use<'a>, RemoteError> {
    match raw.get(key) {
        None | Some(Value::Null) | Some(Value::Array(_)) => Ok(rows(raw.get(key))),
        Some(other) => Err(RemoteError::Malformed(format!("`{key}` is not a list: {other}"))),
    }
}

pub fn manifest_meta(data: &Value, requested: WarehouseId) -> Result<ManifestMeta, RemoteError> {
    let raw = first_row(data).ok_or_else(|| RemoteError::Malformed("manifest metadata not found".into()))?;
    Ok(ManifestMeta {
        warehouse: warehouse(raw.get("cd")).unwrap_or(requested),
        row_count: non_negative(raw.get("row_count")),
        zone_count: non_negative(raw.get("zonas_count")),
        fingerprint: string(raw.get("manifest_hash")),
        generated_at: timestamp(raw.get("generated_at")).unwrap_or_else(Utc::now),
        source_run_id: nullable_string(raw.get("source_run_id")),
    })
}

pub fn manifest_item(raw: &Object, requested: WarehouseId) -> Option<ManifestItem> {
    let address = normalize_address(&string(raw.get("endereco")));
    if address.is_empty() {
        return None;
    }
    Some(ManifestItem {
        warehouse: warehouse(raw.get("cd")).unwrap_or(requested),
        zone: normalize_zone(&string(raw.get("zona"))),
        address,
        product_code: product_code(raw.get("coddv"))?,
        description: string(raw.get("descricao")).trim().to_string(),
        expected_qty: non_negative(raw.get("estoque")),
    })
}

pub fn manifest_items(data: &Value, requested: WarehouseId) -> Vec<ManifestItem> {
    rows(Some(data)).filter_map(|raw| manifest_item(raw, requested)).collect()
}

pub fn count(raw: &Object, cycle_date: NaiveDate) -> Option<CountRecord> {
    let address = normalize_address(&string(raw.get("endereco")));
    if address.is_empty() {
        return None;
    }
    Some(CountRecord {
        cycle_date: date(raw.get("cycle_date")).unwrap_or(cycle_date),
        warehouse: warehouse(raw.get("cd"))?,
        zone: normalize_zone(&string(raw.get("zona"))),
        address,
        product_code: product_code(raw.get("coddv"))?,
        description: string(raw.get("descricao")).trim().to_string(),
        expected_qty: non_negative(raw.get("estoque")),
        stage: stage(raw.get("etapa")),
        counted_qty: non_negative(raw.get("qtd_contada")),
        barcode: nullable_string(raw.get("barras")),
        result: result(raw.get("resultado")),
        counted_by: counter(raw, "counted_by", "counted_mat", "counted_nome"),
        updated_at: timestamp(raw.get("updated_at")).unwrap_or_else(Utc::now),
    })
}

pub fn review(raw: &Object, cycle_date: NaiveDate) -> Option<ReviewRecord> {
    let address = normalize_address(&string(raw.get("endereco")));
    if address.is_empty() {
        return None;
    }
    let resolved_by = nullable_string(raw.get("resolved_by"))
        .map(|_| counter(raw, "resolved_by", "resolved_mat", "resolved_nome"));
    Some(ReviewRecord {
        cycle_date: date(raw.get("cycle_date")).unwrap_or(cycle_date),
        warehouse: warehouse(raw.get("cd"))?,
        zone: normalize_zone(&string(raw.get("zona"))),
        address,
        product_code: product_code(raw.get("coddv"))?,
        description: string(raw.get("descricao")).trim().to_string(),
        expected_qty: non_negative(raw.get("estoque")),
        reason: review_reason(raw.get("reason_code")),
        snapshot: match raw.get("snapshot") {
            Some(Value::Object(obj)) => Value::Object(obj.clone()),
            _ => Value::Object(Map::new()),
        },
        status: review_status(raw.get("status")),
        final_qty: match raw.get("final_qtd") {
            None | Some(Value::Null) => None,
            value => Some(non_negative(value)),
        },
        final_barcode: nullable_string(raw.get("final_barras")),
        final_result: nullable_string(raw.get("final_resultado")).map(|r| result(Some(&Value::String(r)))),
        resolved_by,
        resolved_at: timestamp(raw.get("resolved_at")),
        updated_at: timestamp(raw.get("updated_at")).unwrap_or_else(Utc::now),
    })
}

/// A lease; `None` when the id is missing or invalid.
pub fn lock(raw: &Object, cycle_date: NaiveDate, requested: Option<WarehouseId>) -> Option<ZoneLock> {
    let lock_id: LockId = nullable_string(raw.get("lock_id"))?.parse().ok()?;
    let now = Utc::now();
    Some(ZoneLock {
        lock_id,
        cycle_date: date(raw.get("cycle_date")).unwrap_or(cycle_date),
        warehouse: warehouse(raw.get("cd")).or(requested)?,
        zone: normalize_zone(&string(raw.get("zona"))),
        stage: stage(raw.get("etapa")),
        holder: counter(raw, "locked_by", "locked_mat", "locked_nome"),
        heartbeat_at: timestamp(raw.get("heartbeat_at")).unwrap_or(now),
        expires_at: timestamp(raw.get("expires_at")).unwrap_or(now),
    })
}

pub fn lock_response(
    data: &Value,
    cycle_date: NaiveDate,
    requested: Option<WarehouseId>,
) -> Result<ZoneLock, RemoteError> {
    first_row(data)
        .and_then(|raw| lock(raw, cycle_date, requested))
        .ok_or_else(|| RemoteError::Malformed("lease response without a valid lock id".into()))
}

pub fn sync_pull(data: &Value, cycle_date: NaiveDate) -> Result<RemoteState, RemoteError> {
    let raw = first_row(data).ok_or_else(|| RemoteError::Malformed("sync_pull returned no state row".into()))?;
    Ok(RemoteState {
        counts: list(raw, "counts")?.filter_map(|r| count(r, cycle_date)).collect(),
        reviews: list(raw, "reviews")?.filter_map(|r| review(r, cycle_date)).collect(),
        locks: list(raw, "locks")?.filter_map(|r| lock(r, cycle_date, None)).collect(),
        server_time: timestamp(raw.get("server_time")),
    })
}

pub fn apply_response(data: &Value) -> Result<ApplyResponse, RemoteError> {
    let raw = first_row(data).ok_or_else(|| RemoteError::Malformed("invalid apply_event response".into()))?;
    Ok(ApplyResponse {
        accepted: boolean(raw.get("accepted")),
        info: string(raw.get("info")),
        updated_at: timestamp(raw.get("updated_at")).unwrap_or_else(Utc::now),
    })
}

pub fn release_response(data: &Value) -> bool {
    match data {
        Value::Array(rows) => rows.first().is_some_and(|v| boolean(Some(v))),
        other => boolean(Some(other)),
    }
}

/// Human-readable message of an error body.
pub fn error_message(body: &Value) -> String {
    if let Some(obj) = body.as_object() {
        for key in ["message", "error_description", "details", "hint"] {
            if let Some(msg) = nullable_string(obj.get(key)) {
                return msg;
            }
        }
    }
    nullable_string(Some(body)).unwrap_or_else(|| "unexpected error".to_string())
}
