//! Per-user preferences.

use chrono::Utc;
use countsync_core::{UserId, WarehouseId};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::{LocalStore, StoreError, StoreResult, ts};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub active_warehouse: Option<WarehouseId>,
    /// Queue every mutation even while connected.
    pub prefer_offline: bool,
}

impl LocalStore {
    /// Stored preferences, or the defaults when none were saved.
    pub async fn preferences(&self, user: UserId) -> StoreResult<Preferences> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT active_cd, prefer_offline FROM prefs WHERE user_id = ?1")
            .bind(user.to_string())
            .fetch_optional(&pool)
            .await?;

        let Some(row) = row else {
            return Ok(Preferences::default());
        };
        let active: Option<i64> = row.try_get("active_cd")?;
        let active_warehouse = active
            .map(|cd| {
                u32::try_from(cd)
                    .map(WarehouseId::new)
                    .map_err(|_| StoreError::corrupt("prefs", format!("active_cd = {cd}")))
            })
            .transpose()?;
        Ok(Preferences {
            active_warehouse,
            prefer_offline: row.try_get("prefer_offline")?,
        })
    }

    pub async fn put_preferences(&self, user: UserId, prefs: Preferences) -> StoreResult<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO prefs (user_id, active_cd, prefer_offline, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (user_id) DO UPDATE SET
                active_cd = excluded.active_cd,
                prefer_offline = excluded.prefer_offline,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user.to_string())
        .bind(prefs.active_warehouse.map(|cd| i64::from(cd.get())))
        .bind(prefs.prefer_offline)
        .bind(ts(Utc::now()))
        .execute(&pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preferences_default_then_persist_and_clear_with_user() {
        let store = LocalStore::in_memory();
        let user = UserId::new();
        assert_eq!(store.preferences(user).await.unwrap(), Preferences::default());

        let prefs = Preferences {
            active_warehouse: Some(WarehouseId::new(4)),
            prefer_offline: true,
        };
        store.put_preferences(user, prefs).await.unwrap();
        assert_eq!(store.preferences(user).await.unwrap(), prefs);

        store.clear_user(user).await.unwrap();
        assert_eq!(store.preferences(user).await.unwrap(), Preferences::default());
    }
}
