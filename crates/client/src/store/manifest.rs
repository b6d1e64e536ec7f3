//! Manifest snapshot records.

use chrono::Utc;
use countsync_core::{UserId, WarehouseId};
use countsync_counting::{ManifestItem, ManifestMeta, normalize_zone};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{LocalStore, StoreError, StoreResult, from_db_code, parse_ts, to_db_code, ts};

const TABLE: &str = "manifest_items";

impl LocalStore {
    /// Replace a warehouse snapshot wholesale.
    ///
    /// Runs in one transaction: readers see either the previous snapshot or the
    /// complete new one.
    pub async fn manifest_replace(
        &self,
        user: UserId,
        meta: &ManifestMeta,
        items: &[ManifestItem],
    ) -> StoreResult<()> {
        let pool = self.pool().await?;
        let cd = i64::from(meta.warehouse.get());
        let user_key = user.to_string();

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM manifest_items WHERE user_id = ?1 AND cd = ?2")
            .bind(&user_key)
            .bind(cd)
            .execute(&mut *tx)
            .await?;

        for (position, item) in items.iter().enumerate() {
            let key = item.key();
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO manifest_items (
                    user_id, cd, zona, endereco, coddv, descricao, estoque, position
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&user_key)
            .bind(cd)
            .bind(&key.zone)
            .bind(&key.address)
            .bind(to_db_code(key.product_code)?)
            .bind(&item.description)
            .bind(i64::from(item.expected_qty))
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO manifest_meta (
                user_id, cd, row_count, zone_count, manifest_hash, generated_at, source_run_id, cached_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (user_id, cd) DO UPDATE SET
                row_count = excluded.row_count,
                zone_count = excluded.zone_count,
                manifest_hash = excluded.manifest_hash,
                generated_at = excluded.generated_at,
                source_run_id = excluded.source_run_id,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(&user_key)
        .bind(cd)
        .bind(i64::from(meta.row_count))
        .bind(i64::from(meta.zone_count))
        .bind(&meta.fingerprint)
        .bind(ts(meta.generated_at))
        .bind(&meta.source_run_id)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(%user, cd = %meta.warehouse, rows = items.len(), "manifest snapshot replaced");
        Ok(())
    }

    /// Items of the cached snapshot, in download order.
    pub async fn manifest_items(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<Vec<ManifestItem>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT zona, endereco, coddv, descricao, estoque
            FROM manifest_items
            WHERE user_id = ?1 AND cd = ?2
            ORDER BY position
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .fetch_all(&pool)
        .await?;

        rows.iter().map(|row| item_from_row(warehouse, row)).collect()
    }

    pub async fn manifest_items_by_zone(
        &self,
        user: UserId,
        warehouse: WarehouseId,
        zone: &str,
    ) -> StoreResult<Vec<ManifestItem>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT zona, endereco, coddv, descricao, estoque
            FROM manifest_items
            WHERE user_id = ?1 AND cd = ?2 AND zona = ?3
            ORDER BY position
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .bind(normalize_zone(zone))
        .fetch_all(&pool)
        .await?;

        rows.iter().map(|row| item_from_row(warehouse, row)).collect()
    }

    pub async fn manifest_zones(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<Vec<String>> {
        let pool = self.pool().await?;
        let zones = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT zona FROM manifest_items WHERE user_id = ?1 AND cd = ?2 ORDER BY zona",
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .fetch_all(&pool)
        .await?;
        Ok(zones)
    }

    pub async fn manifest_len(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<u32> {
        let pool = self.pool().await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manifest_items WHERE user_id = ?1 AND cd = ?2")
            .bind(user.to_string())
            .bind(i64::from(warehouse.get()))
            .fetch_one(&pool)
            .await?;
        u32::try_from(n).map_err(|_| StoreError::corrupt(TABLE, format!("row count {n} out of range")))
    }

    pub async fn manifest_meta(&self, user: UserId, warehouse: WarehouseId) -> StoreResult<Option<ManifestMeta>> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT row_count, zone_count, manifest_hash, generated_at, source_run_id
            FROM manifest_meta
            WHERE user_id = ?1 AND cd = ?2
            "#,
        )
        .bind(user.to_string())
        .bind(i64::from(warehouse.get()))
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let generated_at: String = row.try_get("generated_at")?;
        Ok(Some(ManifestMeta {
            warehouse,
            row_count: count_col(&row, "row_count")?,
            zone_count: count_col(&row, "zone_count")?,
            fingerprint: row.try_get("manifest_hash")?,
            generated_at: parse_ts("manifest_meta", &generated_at)?,
            source_run_id: row.try_get("source_run_id")?,
        }))
    }
}

fn item_from_row(warehouse: WarehouseId, row: &SqliteRow) -> StoreResult<ManifestItem> {
    Ok(ManifestItem {
        warehouse,
        zone: row.try_get("zona")?,
        address: row.try_get("endereco")?,
        product_code: from_db_code(TABLE, row.try_get("coddv")?)?,
        description: row.try_get("descricao")?,
        expected_qty: count_col(row, "estoque")?,
    })
}

fn count_col(row: &SqliteRow, column: &'static str) -> StoreResult<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| StoreError::corrupt(TABLE, format!("{column} = {raw} out of range")))
}
