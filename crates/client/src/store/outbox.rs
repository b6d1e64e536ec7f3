//! Pending-event outbox persisted in SQLite.
//!
//! Entries are scoped by user, warehouse and cycle date and drained in
//! creation order. Each transition touches exactly one row.

use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{ClientEventId, DomainResult, UserId, WarehouseId};
use countsync_counting::{CountEvent, EventType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{LocalStore, StoreError, StoreResult, parse_ts, to_count, ts};

const TABLE: &str = "pending_events";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Never attempted.
    Pending,
    /// Attempted at least once and not accepted; retried on the next drain.
    Error,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Error => "error",
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for OutboxStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for OutboxStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "error" => Ok(OutboxStatus::Error),
            _ => Err(format!("invalid OutboxStatus: {}", s).into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for OutboxStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// A locally queued mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Idempotency key sent with every attempt.
    pub client_event_id: ClientEventId,
    pub user_id: UserId,
    pub warehouse: WarehouseId,
    pub cycle_date: NaiveDate,
    pub event_type: EventType,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingEvent {
    /// Wrap `event` with a fresh idempotency key.
    pub fn new(user_id: UserId, event: &CountEvent, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            client_event_id: ClientEventId::new(),
            user_id,
            warehouse: event.warehouse(),
            cycle_date: event.cycle_date(),
            event_type: event.event_type(),
            payload: event.to_payload()?,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn event(&self) -> DomainResult<CountEvent> {
        CountEvent::from_payload(self.event_type, &self.payload)
    }
}

impl LocalStore {
    pub async fn outbox_put(&self, event: &PendingEvent) -> StoreResult<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO pending_events (
                client_event_id, user_id, cd, cycle_date, event_type, payload,
                status, attempt_count, error_message, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(event.client_event_id.to_string())
        .bind(event.user_id.to_string())
        .bind(i64::from(event.warehouse.get()))
        .bind(event.cycle_date.to_string())
        .bind(event.event_type.as_str())
        .bind(event.payload.to_string())
        .bind(event.status)
        .bind(i64::from(event.attempt_count))
        .bind(&event.error_message)
        .bind(ts(event.created_at))
        .bind(ts(event.updated_at))
        .execute(&pool)
        .await?;

        tracing::debug!(id = %event.client_event_id, kind = %event.event_type, "event queued");
        Ok(())
    }

    pub async fn outbox_get(&self, user: UserId, id: ClientEventId) -> StoreResult<Option<PendingEvent>> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT client_event_id, user_id, cd, cycle_date, event_type, payload,
                   status, attempt_count, error_message, created_at, updated_at
            FROM pending_events
            WHERE user_id = ?1 AND client_event_id = ?2
            "#,
        )
        .bind(user.to_string())
        .bind(id.to_string())
        .fetch_optional(&pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    /// Entries of one cycle, oldest first (ties broken by insertion order).
    pub async fn outbox_list(
        &self,
        user: UserId,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
    ) -> StoreResult<Vec<PendingEvent>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT client_event_id, user_id, cd, cycle_date, event_type, payload,
                   status, attempt_count, error_message, created_at, updated_at
            FROM pending_events
            WHERE user_id = ?1 AND cd = ?2 AND cycle_date = ?3
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(cycle_date.to_string())
        .fetch_all(&pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    pub async fn outbox_count(
        &self,
        user: UserId,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
    ) -> StoreResult<usize> {
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_events WHERE user_id = ?1 AND cd = ?2 AND cycle_date = ?3",
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(cycle_date.to_string())
        .fetch_one(&pool)
        .await?;
        to_count(TABLE, n)
    }

    /// Entries that failed at least once.
    pub async fn outbox_error_count(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<usize> {
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_events WHERE user_id = ?1 AND cd = ?2 AND status = ?3",
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(OutboxStatus::Error)
        .fetch_one(&pool)
        .await?;
        to_count(TABLE, n)
    }

    /// Returns whether an entry was removed.
    pub async fn outbox_delete(&self, user: UserId, id: ClientEventId) -> StoreResult<bool> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM pending_events WHERE user_id = ?1 AND client_event_id = ?2")
            .bind(user.to_string())
            .bind(id.to_string())
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt.
    pub async fn outbox_mark_error(
        &self,
        user: UserId,
        id: ClientEventId,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            UPDATE pending_events
            SET status = ?3,
                attempt_count = attempt_count + 1,
                error_message = ?4,
                updated_at = ?5
            WHERE user_id = ?1 AND client_event_id = ?2
            "#,
        )
        .bind(user.to_string())
        .bind(id.to_string())
        .bind(OutboxStatus::Error)
        .bind(message)
        .bind(ts(now))
        .execute(&pool)
        .await?;
        Ok(())
    }
}

fn event_from_row(row: &SqliteRow) -> StoreResult<PendingEvent> {
    let id: String = row.try_get("client_event_id")?;
    let user: String = row.try_get("user_id")?;
    let cd: i64 = row.try_get("cd")?;
    let cycle: String = row.try_get("cycle_date")?;
    let kind: String = row.try_get("event_type")?;
    let payload: String = row.try_get("payload")?;
    let attempts: i64 = row.try_get("attempt_count")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let corrupt = |what: &str, e: &dyn std::fmt::Display| StoreError::corrupt(TABLE, format!("{what}: {e}"));

    Ok(PendingEvent {
        client_event_id: id.parse().map_err(|e| corrupt("client_event_id", &e))?,
        user_id: user.parse().map_err(|e| corrupt("user_id", &e))?,
        warehouse: u32::try_from(cd)
            .map(WarehouseId::new)
            .map_err(|e| corrupt("cd", &e))?,
        cycle_date: cycle.parse().map_err(|e| corrupt("cycle_date", &e))?,
        event_type: kind.parse().map_err(|e| corrupt("event_type", &e))?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt("payload", &e))?,
        status: row.try_get("status")?,
        attempt_count: u32::try_from(attempts).map_err(|e| corrupt("attempt_count", &e))?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(TABLE, &created_at)?,
        updated_at: parse_ts(TABLE, &updated_at)?,
    })
}
