//! Counting cycle dates.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

/// The cycle date in effect at `now`, as seen at the warehouses' UTC offset.
///
/// Offsets outside +-24h fall back to UTC.
pub fn cycle_date_at(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}
