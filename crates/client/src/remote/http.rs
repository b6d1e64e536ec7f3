//! HTTP transport to the remote reconciliation service (PostgREST-style RPC).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use countsync_core::{ClientEventId, LockId, WarehouseId};
use countsync_counting::{EventType, ManifestItem, ManifestMeta, RemoteState, Stage, ZoneLock, cycle_date_at};
use serde_json::{Value, json};

use super::{ApplyResponse, RemoteError, RemoteService, wire};
use crate::config::EngineConfig;

/// Client for the `rpc_conf_inventario_*` procedures.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
    /// Cycle date for lease rows that do not carry one.
    cycle_offset_minutes: i32,
}

impl HttpRemote {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            access_token: None,
            cycle_offset_minutes: EngineConfig::default().cycle_utc_offset_minutes,
        }
    }

    /// Build from configuration; `None` when no API URL is configured.
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        let url = config.api_url.as_ref()?;
        Some(Self::new(url.clone(), config.api_key.clone()).with_cycle_offset(config.cycle_utc_offset_minutes))
    }

    pub fn with_cycle_offset(mut self, minutes: i32) -> Self {
        self.cycle_offset_minutes = minutes;
        self
    }

    fn cycle_date_at(&self, now: DateTime<Utc>) -> NaiveDate {
        cycle_date_at(now, self.cycle_offset_minutes)
    }

    /// Authenticate calls as a signed-in user.
    pub fn with_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    async fn rpc(&self, procedure: &str, params: Value) -> Result<Value, RemoteError> {
        let url = format!("{}/rest/v1/rpc/rpc_conf_inventario_{procedure}", self.api_url);
        let mut req = self.client.post(&url).json(&params);
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key);
        }
        if let Some(token) = self.access_token.as_ref().or(self.api_key.as_ref()) {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| RemoteError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| RemoteError::Network(e.to_string()))?;
        let value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(Value::String(body))
        };

        if status.is_success() {
            return Ok(value);
        }
        tracing::debug!(procedure, status = status.as_u16(), "rpc failed");
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            return Err(RemoteError::Network(format!("{status}: {}", wire::error_message(&value))));
        }
        Err(RemoteError::rejected(wire::error_message(&value)))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn manifest_meta(&self, warehouse: WarehouseId) -> Result<ManifestMeta, RemoteError> {
        let data = self.rpc("manifest_meta", json!({ "p_cd": warehouse.get() })).await?;
        wire::manifest_meta(&data, warehouse)
    }

    async fn manifest_items_page(
        &self,
        warehouse: WarehouseId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ManifestItem>, RemoteError> {
        let params = json!({ "p_cd": warehouse.get(), "p_offset": offset, "p_limit": limit.max(1) });
        let data = self.rpc("manifest_items_page", params).await?;
        Ok(wire::manifest_items(&data, warehouse))
    }

    async fn sync_pull(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> Result<RemoteState, RemoteError> {
        let params = json!({
            "p_cd": warehouse.get(),
            "p_cycle_date": cycle_date.to_string(),
            "p_since": since.map(|t| t.to_rfc3339()),
        });
        let data = self.rpc("sync_pull", params).await?;
        wire::sync_pull(&data, cycle_date)
    }

    async fn apply_event(
        &self,
        event_type: EventType,
        payload: &Value,
        client_event_id: ClientEventId,
    ) -> Result<ApplyResponse, RemoteError> {
        let params = json!({
            "p_event_type": event_type.as_str(),
            "p_payload": payload,
            "p_client_event_id": client_event_id.to_string(),
        });
        let data = self.rpc("apply_event", params).await?;
        wire::apply_response(&data)
    }

    async fn acquire_lock(
        &self,
        warehouse: WarehouseId,
        cycle_date: NaiveDate,
        zone: &str,
        stage: Stage,
        ttl: Duration,
    ) -> Result<ZoneLock, RemoteError> {
        let params = json!({
            "p_cd": warehouse.get(),
            "p_cycle_date": cycle_date.to_string(),
            "p_zona": zone,
            "p_etapa": stage.number(),
            "p_ttl_seconds": ttl.as_secs(),
        });
        let data = self.rpc("lock_acquire", params).await?;
        wire::lock_response(&data, cycle_date, Some(warehouse))
    }

    async fn heartbeat_lock(&self, lock_id: LockId, ttl: Duration) -> Result<ZoneLock, RemoteError> {
        let params = json!({ "p_lock_id": lock_id.to_string(), "p_ttl_seconds": ttl.as_secs() });
        let data = self.rpc("lock_heartbeat", params).await?;
        wire::lock_response(&data, self.cycle_date_at(Utc::now()), None)
    }

    async fn release_lock(&self, lock_id: LockId) -> Result<bool, RemoteError> {
        let data = self.rpc("lock_release", json!({ "p_lock_id": lock_id.to_string() })).await?;
        Ok(wire::release_response(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_without_url_has_no_transport() {
        assert!(HttpRemote::from_config(&EngineConfig::default()).is_none());
        let remote = HttpRemote::from_config(&EngineConfig::default().with_api("https://x.test/", None)).unwrap();
        assert_eq!(remote.api_url, "https://x.test");
    }

    #[test]
    fn lease_rows_without_a_date_use_the_configured_cycle_offset() {
        use chrono::TimeZone;

        // 01:30 UTC on the 11th is still the 10th at UTC-3.
        let now = Utc.with_ymd_and_hms(2025, 3, 11, 1, 30, 0).unwrap();
        let config = EngineConfig::default().with_api("https://x.test", None);
        let local = HttpRemote::from_config(&config.clone().with_cycle_utc_offset(-180)).unwrap();
        let utc = HttpRemote::from_config(&config.with_cycle_utc_offset(0)).unwrap();

        assert_eq!(local.cycle_date_at(now), NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(utc.cycle_date_at(now), NaiveDate::from_ymd_opt(2025, 3, 11).unwrap());

        let lease = json!([{ "lock_id": LockId::new().to_string(), "cd": 2, "zona": "a" }]);
        let lock = wire::lock_response(&lease, local.cycle_date_at(now), None).unwrap();
        assert_eq!(lock.cycle_date, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let remote = HttpRemote::new("http://127.0.0.1:9", None);
        let err = remote.manifest_meta(WarehouseId::new(1)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }
}
