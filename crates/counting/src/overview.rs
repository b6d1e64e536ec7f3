//! Per-zone progress views over derived rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::derive::Row;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneOverview {
    pub zone: String,
    pub total_items: usize,
    pub first_pending: usize,
    pub first_done: usize,
    /// Surplus items still waiting for their second count.
    pub second_pending: usize,
    pub second_done: usize,
    pub reviews_pending: usize,
    pub final_done: usize,
}

/// Distinct zones, sorted.
pub fn zones(rows: &[Row]) -> Vec<String> {
    let mut zones: Vec<String> = rows.iter().map(|r| r.key.zone.clone()).collect();
    zones.sort();
    zones.dedup();
    zones
}

/// Progress counters for every zone, sorted by zone.
pub fn zone_overview(rows: &[Row]) -> Vec<ZoneOverview> {
    let mut by_zone: BTreeMap<&str, ZoneOverview> = BTreeMap::new();
    for row in rows {
        let entry = by_zone.entry(row.key.zone.as_str()).or_insert_with(|| ZoneOverview {
            zone: row.key.zone.clone(),
            ..ZoneOverview::default()
        });
        entry.total_items += 1;
        if row.first.is_some() {
            entry.first_done += 1;
        } else {
            entry.first_pending += 1;
        }
        if row.awaits_second() {
            entry.second_pending += 1;
        }
        if row.second.is_some() {
            entry.second_done += 1;
        }
        if row.review_pending() {
            entry.reviews_pending += 1;
        }
        if row.is_final {
            entry.final_done += 1;
        }
    }
    by_zone.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive;
    use crate::fixtures::{count, item};
    use crate::model::{RemoteState, Stage};

    #[test]
    fn overview_counts_each_stage() {
        let manifest = vec![
            item("B", "R1", 1, 10),
            item("A", "R1", 2, 10),
            item("A", "R2", 3, 10),
            item("", "R3", 4, 10),
        ];
        let state = RemoteState {
            counts: vec![
                count(&manifest[1], Stage::First, 10, false),
                count(&manifest[2], Stage::First, 12, false),
            ],
            ..RemoteState::default()
        };
        let rows = derive(&manifest, &state);

        assert_eq!(zones(&rows), vec!["A", "B", "SEM ZONA"]);

        let overview = zone_overview(&rows);
        let a = &overview[0];
        assert_eq!(a.zone, "A");
        assert_eq!(a.total_items, 2);
        assert_eq!(a.first_done, 2);
        assert_eq!(a.first_pending, 0);
        assert_eq!(a.second_pending, 1);
        assert_eq!(a.final_done, 1);
        assert_eq!(overview[1].first_pending, 1);
        assert_eq!(overview[2].zone, "SEM ZONA");
    }
}
