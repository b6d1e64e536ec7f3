//! Mutations submitted by the counting UI.
//!
//! Field names on the wire follow the remote RPC payloads; the Rust names are
//! kept in English.

use core::fmt;
use core::str::FromStr;

use chrono::NaiveDate;
use countsync_core::{DomainError, DomainResult, WarehouseId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ItemKey, ManifestItem, Stage, normalize_address, normalize_zone};
use crate::result::CountResult;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CountUpsert,
    ReviewResolve,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CountUpsert => "count_upsert",
            EventType::ReviewResolve => "review_resolve",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "count_upsert" => Ok(EventType::CountUpsert),
            "review_resolve" => Ok(EventType::ReviewResolve),
            other => Err(DomainError::validation(format!("unknown event type '{other}'"))),
        }
    }
}

/// Write (or overwrite) the count of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountUpsert {
    pub cycle_date: NaiveDate,
    #[serde(rename = "cd")]
    pub warehouse: WarehouseId,
    #[serde(rename = "zona")]
    pub zone: String,
    #[serde(rename = "endereco")]
    pub address: String,
    #[serde(rename = "coddv")]
    pub product_code: u64,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "estoque")]
    pub expected_qty: u32,
    #[serde(rename = "etapa")]
    pub stage: Stage,
    #[serde(rename = "qtd_contada")]
    pub counted_qty: u32,
    #[serde(rename = "barras", default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub discarded: bool,
}

impl CountUpsert {
    pub fn for_item(item: &ManifestItem, cycle_date: NaiveDate, stage: Stage, counted_qty: u32) -> Self {
        Self {
            cycle_date,
            warehouse: item.warehouse,
            zone: item.zone.clone(),
            address: item.address.clone(),
            product_code: item.product_code,
            description: item.description.clone(),
            expected_qty: item.expected_qty,
            stage,
            counted_qty,
            barcode: None,
            discarded: false,
        }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    pub fn discard(mut self) -> Self {
        self.discarded = true;
        self
    }

    pub fn result(&self) -> CountResult {
        CountResult::classify(self.expected_qty, self.counted_qty, self.discarded)
    }
}

/// Close a pending review with an arbitrated quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResolve {
    pub cycle_date: NaiveDate,
    #[serde(rename = "cd")]
    pub warehouse: WarehouseId,
    #[serde(rename = "zona")]
    pub zone: String,
    #[serde(rename = "endereco")]
    pub address: String,
    #[serde(rename = "coddv")]
    pub product_code: u64,
    #[serde(rename = "estoque")]
    pub expected_qty: u32,
    #[serde(rename = "final_qtd")]
    pub final_qty: u32,
    #[serde(rename = "final_barras", default)]
    pub final_barcode: Option<String>,
}

impl ReviewResolve {
    pub fn for_item(item: &ManifestItem, cycle_date: NaiveDate, final_qty: u32) -> Self {
        Self {
            cycle_date,
            warehouse: item.warehouse,
            zone: item.zone.clone(),
            address: item.address.clone(),
            product_code: item.product_code,
            expected_qty: item.expected_qty,
            final_qty,
            final_barcode: None,
        }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.final_barcode = Some(barcode.into());
        self
    }

    pub fn result(&self) -> CountResult {
        CountResult::classify(self.expected_qty, self.final_qty, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountEvent {
    CountUpsert(CountUpsert),
    ReviewResolve(ReviewResolve),
}

impl From<CountUpsert> for CountEvent {
    fn from(value: CountUpsert) -> Self {
        CountEvent::CountUpsert(value)
    }
}

impl From<ReviewResolve> for CountEvent {
    fn from(value: ReviewResolve) -> Self {
        CountEvent::ReviewResolve(value)
    }
}

impl CountEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            CountEvent::CountUpsert(_) => EventType::CountUpsert,
            CountEvent::ReviewResolve(_) => EventType::ReviewResolve,
        }
    }

    pub fn warehouse(&self) -> WarehouseId {
        match self {
            CountEvent::CountUpsert(e) => e.warehouse,
            CountEvent::ReviewResolve(e) => e.warehouse,
        }
    }

    pub fn cycle_date(&self) -> NaiveDate {
        match self {
            CountEvent::CountUpsert(e) => e.cycle_date,
            CountEvent::ReviewResolve(e) => e.cycle_date,
        }
    }

    pub fn key(&self) -> ItemKey {
        match self {
            CountEvent::CountUpsert(e) => ItemKey::new(&e.zone, &e.address, e.product_code),
            CountEvent::ReviewResolve(e) => ItemKey::new(&e.zone, &e.address, e.product_code),
        }
    }

    /// Canonical form: normalized key labels, trimmed barcodes, a discarded
    /// count carries quantity 0, and a barcode is kept only for a surplus.
    pub fn normalized(&self) -> Self {
        match self {
            CountEvent::CountUpsert(e) => {
                let mut e = e.clone();
                e.zone = normalize_zone(&e.zone);
                e.address = normalize_address(&e.address);
                if e.discarded {
                    e.counted_qty = 0;
                }
                e.barcode = if e.result().is_surplus() {
                    clean_barcode(e.barcode.as_deref())
                } else {
                    None
                };
                CountEvent::CountUpsert(e)
            }
            CountEvent::ReviewResolve(e) => {
                let mut e = e.clone();
                e.zone = normalize_zone(&e.zone);
                e.address = normalize_address(&e.address);
                e.final_barcode = if e.final_qty > e.expected_qty {
                    clean_barcode(e.final_barcode.as_deref())
                } else {
                    None
                };
                CountEvent::ReviewResolve(e)
            }
        }
    }

    /// Structural checks that need no lookup: a non-empty address, a positive
    /// product code, and a barcode wherever the quantity exceeds the stock.
    pub fn validate_shape(&self) -> DomainResult<()> {
        let key = self.key();
        if key.address.is_empty() {
            return Err(DomainError::validation("address is required"));
        }
        if key.product_code == 0 {
            return Err(DomainError::validation("product code must be positive"));
        }
        match self {
            CountEvent::CountUpsert(e) => {
                if e.result().is_surplus() && clean_barcode(e.barcode.as_deref()).is_none() {
                    return Err(DomainError::validation(
                        "surplus detected: a barcode is required or the count must be discarded",
                    ));
                }
            }
            CountEvent::ReviewResolve(e) => {
                if e.final_qty > e.expected_qty && clean_barcode(e.final_barcode.as_deref()).is_none() {
                    return Err(DomainError::validation(
                        "final quantity above stock requires a barcode",
                    ));
                }
            }
        }
        Ok(())
    }

    /// The barcode that has to match the product, if any.
    pub fn barcode_to_verify(&self) -> Option<String> {
        match self.normalized() {
            CountEvent::CountUpsert(e) => e.barcode,
            CountEvent::ReviewResolve(e) => e.final_barcode,
        }
    }

    pub fn to_payload(&self) -> DomainResult<Value> {
        let value = match self {
            CountEvent::CountUpsert(e) => serde_json::to_value(e),
            CountEvent::ReviewResolve(e) => serde_json::to_value(e),
        };
        value.map_err(|e| DomainError::validation(format!("payload encoding failed: {e}")))
    }

    pub fn from_payload(event_type: EventType, payload: &Value) -> DomainResult<Self> {
        let decoded = match event_type {
            EventType::CountUpsert => {
                serde_json::from_value::<CountUpsert>(payload.clone()).map(CountEvent::CountUpsert)
            }
            EventType::ReviewResolve => {
                serde_json::from_value::<ReviewResolve>(payload.clone()).map(CountEvent::ReviewResolve)
            }
        };
        decoded.map_err(|e| DomainError::validation(format!("invalid {event_type} payload: {e}")))
    }
}

fn clean_barcode(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{cycle, item};
    use serde_json::json;

    #[test]
    fn count_payload_uses_wire_field_names() {
        let event = CountEvent::from(
            CountUpsert::for_item(&item("a", "r1", 5, 10), cycle(), Stage::Second, 12).with_barcode("7891"),
        );
        let payload = event.to_payload().unwrap();
        assert_eq!(payload["cd"], json!(2));
        assert_eq!(payload["zona"], json!("a"));
        assert_eq!(payload["etapa"], json!(2));
        assert_eq!(payload["qtd_contada"], json!(12));
        assert_eq!(payload["barras"], json!("7891"));
        assert_eq!(payload["discarded"], json!(false));
        assert_eq!(payload["cycle_date"], json!("2025-03-10"));
    }

    #[test]
    fn payload_without_discard_flag_decodes() {
        let payload = json!({
            "cycle_date": "2025-03-10", "cd": 2, "zona": "A", "endereco": "R1", "coddv": 5,
            "estoque": 3, "etapa": 1, "qtd_contada": 3, "barras": null
        });
        let event = CountEvent::from_payload(EventType::CountUpsert, &payload).unwrap();
        match event {
            CountEvent::CountUpsert(e) => assert!(!e.discarded),
            other => panic!("unexpected {other:?}"),
        }
        assert!(CountEvent::from_payload(EventType::ReviewResolve, &payload).is_err());
    }

    #[test]
    fn surplus_without_barcode_is_rejected() {
        let base = CountUpsert::for_item(&item("A", "R1", 5, 10), cycle(), Stage::First, 12);
        let err = CountEvent::from(base.clone()).validate_shape().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(CountEvent::from(base.clone().with_barcode("  ")).validate_shape().is_err());
        assert!(CountEvent::from(base.clone().with_barcode("789")).validate_shape().is_ok());
        assert!(CountEvent::from(base.discard()).validate_shape().is_ok());
    }

    #[test]
    fn review_above_stock_requires_final_barcode() {
        let resolve = ReviewResolve::for_item(&item("A", "R1", 5, 10), cycle(), 11);
        assert!(CountEvent::from(resolve.clone()).validate_shape().is_err());
        assert!(CountEvent::from(resolve.with_barcode("789")).validate_shape().is_ok());
    }

    #[test]
    fn zero_product_code_is_rejected() {
        let event = CountEvent::from(CountUpsert::for_item(&item("A", "R1", 0, 1), cycle(), Stage::First, 1));
        assert!(event.validate_shape().is_err());
    }

    #[test]
    fn normalization_drops_discarded_quantity_and_spurious_barcode() {
        let event = CountEvent::from(
            CountUpsert::for_item(&item(" a ", "r1", 5, 10), cycle(), Stage::First, 12)
                .with_barcode("789")
                .discard(),
        );
        match event.normalized() {
            CountEvent::CountUpsert(e) => {
                assert_eq!(e.zone, "A");
                assert_eq!(e.address, "R1");
                assert_eq!(e.counted_qty, 0);
                assert_eq!(e.barcode, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_type_tokens() {
        assert_eq!("review_resolve".parse::<EventType>().unwrap(), EventType::ReviewResolve);
        assert_eq!(EventType::CountUpsert.to_string(), "count_upsert");
        assert!("count".parse::<EventType>().is_err());
    }
}
