//! Cached snapshot of server-confirmed state per (user, warehouse, cycle).

use chrono::{NaiveDate, Utc};
use countsync_core::{UserId, WarehouseId};
use countsync_counting::RemoteState;
use serde::de::DeserializeOwned;
use sqlx::Row;

use super::{LocalStore, StoreError, StoreResult, parse_ts, ts};

const TABLE: &str = "remote_state";

impl LocalStore {
    pub async fn remote_state(
        &self,
        user: UserId,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
    ) -> StoreResult<Option<RemoteState>> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT counts, reviews, locks, server_time
            FROM remote_state
            WHERE user_id = ?1 AND cd = ?2 AND cycle_date = ?3
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(cycle_date.to_string())
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let server_time: Option<String> = row.try_get("server_time")?;
        Ok(Some(RemoteState {
            counts: json_col(&row, "counts")?,
            reviews: json_col(&row, "reviews")?,
            locks: json_col(&row, "locks")?,
            server_time: server_time.map(|raw| parse_ts(TABLE, &raw)).transpose()?,
        }))
    }

    /// Replace the cached snapshot.
    pub async fn put_remote_state(
        &self,
        user: UserId,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        state: &RemoteState,
    ) -> StoreResult<()> {
        let pool = self.pool().await?;
        let encode = |value: serde_json::Result<String>| {
            value.map_err(|e| StoreError::corrupt(TABLE, format!("encoding failed: {e}")))
        };

        sqlx::query(
            r#"
            INSERT INTO remote_state (user_id, cd, cycle_date, counts, reviews, locks, server_time, cached_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (user_id, cd, cycle_date) DO UPDATE SET
                counts = excluded.counts,
                reviews = excluded.reviews,
                locks = excluded.locks,
                server_time = excluded.server_time,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(cycle_date.to_string())
        .bind(encode(serde_json::to_string(&state.counts))?)
        .bind(encode(serde_json::to_string(&state.reviews))?)
        .bind(encode(serde_json::to_string(&state.locks))?)
        .bind(state.server_time.map(ts))
        .bind(ts(Utc::now()))
        .execute(&pool)
        .await?;

        tracing::debug!(
            %user,
            cd = %warehouse,
            %cycle_date,
            counts = state.counts.len(),
            reviews = state.reviews.len(),
            locks = state.locks.len(),
            "remote state cached"
        );
        Ok(())
    }
}

fn json_col<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow, column: &'static str) -> StoreResult<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(TABLE, format!("{column}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use countsync_counting::{CountRecord, CountResult, Counter, Stage};

    #[tokio::test]
    async fn snapshot_is_replaced_not_merged() {
        let store = LocalStore::in_memory();
        let user = UserId::new();
        let cd = WarehouseId::new(2);
        let cycle = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        assert!(store.remote_state(user, cd, cycle).await.unwrap().is_none());

        let count = CountRecord {
            cycle_date: cycle,
            warehouse: cd,
            zone: "A".into(),
            address: "R1".into(),
            product_code: 7,
            description: "P7".into(),
            expected_qty: 1,
            stage: Stage::First,
            counted_qty: 1,
            barcode: None,
            result: CountResult::Correct,
            counted_by: Counter { user_id: user, badge: "1".into(), name: "ana".into() },
            updated_at: now,
        };
        let first = RemoteState {
            counts: vec![count],
            server_time: Some(now),
            ..RemoteState::default()
        };
        store.put_remote_state(user, cd, cycle, &first).await.unwrap();
        assert_eq!(store.remote_state(user, cd, cycle).await.unwrap(), Some(first));

        store.put_remote_state(user, cd, cycle, &RemoteState::default()).await.unwrap();
        assert_eq!(store.remote_state(user, cd, cycle).await.unwrap(), Some(RemoteState::default()));

        let other_cycle = cycle.succ_opt().unwrap();
        assert!(store.remote_state(user, cd, other_cycle).await.unwrap().is_none());
    }
}
