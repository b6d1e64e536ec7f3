//! Durable local store (SQLite).
//!
//! One lazily opened pool serves five record families, all partitioned by user
//! and warehouse: manifest items, manifest metadata, the remote-state snapshot
//! cache, the pending-event outbox and per-user preferences.

mod manifest;
mod outbox;
mod prefs;
mod remote_state;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use countsync_core::{UserId, WarehouseId};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::StoreLocation;

pub use outbox::{OutboxStatus, PendingEvent};
pub use prefs::Preferences;

/// Storage failures, kept apart from business rejections.
///
/// A missing record is `Ok(None)`, never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage unavailable: {0}")]
    Unavailable(String),

    #[error("local storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS manifest_items (
        user_id     TEXT    NOT NULL,
        cd          INTEGER NOT NULL,
        zona        TEXT    NOT NULL,
        endereco    TEXT    NOT NULL,
        coddv       INTEGER NOT NULL,
        descricao   TEXT    NOT NULL,
        estoque     INTEGER NOT NULL,
        position    INTEGER NOT NULL,
        PRIMARY KEY (user_id, cd, zona, endereco, coddv)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS manifest_items_by_zone ON manifest_items (user_id, cd, zona)",
    r#"
    CREATE TABLE IF NOT EXISTS manifest_meta (
        user_id       TEXT    NOT NULL,
        cd            INTEGER NOT NULL,
        row_count     INTEGER NOT NULL,
        zone_count    INTEGER NOT NULL,
        manifest_hash TEXT    NOT NULL,
        generated_at  TEXT    NOT NULL,
        source_run_id TEXT    NULL,
        cached_at     TEXT    NOT NULL,
        PRIMARY KEY (user_id, cd)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS remote_state (
        user_id     TEXT    NOT NULL,
        cd          INTEGER NOT NULL,
        cycle_date  TEXT    NOT NULL,
        counts      TEXT    NOT NULL,
        reviews     TEXT    NOT NULL,
        locks       TEXT    NOT NULL,
        server_time TEXT    NULL,
        cached_at   TEXT    NOT NULL,
        PRIMARY KEY (user_id, cd, cycle_date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pending_events (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        client_event_id TEXT    NOT NULL UNIQUE,
        user_id         TEXT    NOT NULL,
        cd              INTEGER NOT NULL,
        cycle_date      TEXT    NOT NULL,
        event_type      TEXT    NOT NULL,
        payload         TEXT    NOT NULL,
        status          TEXT    NOT NULL,
        attempt_count   INTEGER NOT NULL DEFAULT 0,
        error_message   TEXT    NULL,
        created_at      TEXT    NOT NULL,
        updated_at      TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS pending_events_by_cycle ON pending_events (user_id, cd, cycle_date, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS prefs (
        user_id        TEXT    PRIMARY KEY,
        active_cd      INTEGER NULL,
        prefer_offline INTEGER NOT NULL DEFAULT 0,
        updated_at     TEXT    NOT NULL
    )
    "#,
];

/// SQLite-backed store handle.
///
/// Cheap to clone; clones share one pool, opened on first use.
#[derive(Debug, Clone)]
pub struct LocalStore {
    location: StoreLocation,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl LocalStore {
    /// Create a store handle (lazy initialization).
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            pool: Arc::new(Mutex::new(None)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::Memory)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Get the pool, opening the database and creating the schema if needed.
    pub(crate) async fn pool(&self) -> StoreResult<SqlitePool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = open(&self.location)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{e:#}")))?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::debug!(location = ?self.location, "local store initialized");
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Remove every record of a user (logout / session reset).
    pub async fn clear_user(&self, user: UserId) -> StoreResult<()> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        for table in ["manifest_items", "manifest_meta", "remote_state", "pending_events", "prefs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?1"))
                .bind(user.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(%user, "cleared local data for user");
        Ok(())
    }

    /// Remove one warehouse partition of a user, outbox included.
    pub async fn clear_warehouse(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<()> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        for table in ["manifest_items", "manifest_meta", "remote_state", "pending_events"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?1 AND cd = ?2"))
                .bind(user.to_string())
                .bind(i64::from(warehouse.get()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(%user, cd = %warehouse, "cleared local data for warehouse");
        Ok(())
    }

    /// Close the pool; the next call reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

async fn open(location: &StoreLocation) -> anyhow::Result<SqlitePool> {
    match location {
        StoreLocation::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .context("invalid in-memory SQLite options")?;
            // Every connection to :memory: is a separate database; keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .context("failed to open in-memory SQLite database")
        }
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create store directory at {:?}", parent))?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .connect_with(options)
                .await
                .with_context(|| format!("failed to create SQLite pool for LocalStore at {:?}", path))
        }
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("invalid timestamp {raw:?}: {e}")))
}

/// A `COUNT(*)` result as a length.
pub(crate) fn to_count(table: &'static str, n: i64) -> StoreResult<usize> {
    usize::try_from(n).map_err(|_| StoreError::corrupt(table, format!("invalid row count {n}")))
}

pub(crate) fn to_db_code(code: u64) -> StoreResult<i64> {
    i64::try_from(code).map_err(|_| StoreError::corrupt("manifest_items", format!("product code {code} out of range")))
}

pub(crate) fn from_db_code(table: &'static str, code: i64) -> StoreResult<u64> {
    u64::try_from(code).map_err(|_| StoreError::corrupt(table, format!("negative product code {code}")))
}
