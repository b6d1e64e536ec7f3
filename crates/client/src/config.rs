//! Engine configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Where the local database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Process-private database; contents vanish with the store handle.
    Memory,
}

impl StoreLocation {
    /// The default on-disk location under the OS data directory.
    pub fn default_file() -> anyhow::Result<Self> {
        Ok(Self::File(default_db_path()?))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreLocation,
    /// Base URL of the remote reconciliation service.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    /// Period of the background sync timer.
    pub sync_interval: Duration,
    /// Lease time-to-live requested on acquire and heartbeat.
    pub lock_ttl: Duration,
    /// Heartbeat period while a lease is held; shorter than `lock_ttl`.
    pub lock_heartbeat: Duration,
    pub manifest_page_size: u32,
    /// The warehouses' offset from UTC; the local day is the cycle date.
    pub cycle_utc_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreLocation::Memory,
            api_url: None,
            api_key: None,
            sync_interval: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(900),
            lock_heartbeat: Duration::from_secs(60),
            manifest_page_size: 1000,
            cycle_utc_offset_minutes: -180,
        }
    }
}

impl EngineConfig {
    /// Load from `COUNTSYNC_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store = match var("COUNTSYNC_DB_PATH") {
            Some(path) if path == ":memory:" => StoreLocation::Memory,
            Some(path) => StoreLocation::File(PathBuf::from(path)),
            None => StoreLocation::default_file()?,
        };

        let config = Self {
            store,
            api_url: var("COUNTSYNC_API_URL").map(|url| url.trim_end_matches('/').to_string()),
            api_key: var("COUNTSYNC_API_KEY"),
            sync_interval: parse_var(&var, "COUNTSYNC_SYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_interval),
            lock_ttl: parse_var(&var, "COUNTSYNC_LOCK_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            lock_heartbeat: parse_var(&var, "COUNTSYNC_LOCK_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_heartbeat),
            manifest_page_size: parse_var(&var, "COUNTSYNC_MANIFEST_PAGE_SIZE")?
                .unwrap_or(defaults.manifest_page_size),
            cycle_utc_offset_minutes: parse_var(&var, "COUNTSYNC_CYCLE_UTC_OFFSET_MINUTES")?
                .unwrap_or(defaults.cycle_utc_offset_minutes),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_heartbeat.is_zero() {
            anyhow::bail!("lock heartbeat interval must be positive");
        }
        if self.lock_heartbeat >= self.lock_ttl {
            anyhow::bail!(
                "lock heartbeat ({:?}) must be shorter than the lock TTL ({:?})",
                self.lock_heartbeat,
                self.lock_ttl
            );
        }
        if self.manifest_page_size == 0 {
            anyhow::bail!("manifest page size must be positive");
        }
        if self.sync_interval.is_zero() {
            anyhow::bail!("sync interval must be positive");
        }
        Ok(())
    }

    pub fn with_store(mut self, store: StoreLocation) -> Self {
        self.store = store;
        self
    }

    pub fn with_api(mut self, url: impl Into<String>, key: Option<String>) -> Self {
        self.api_url = Some(url.into());
        self.api_key = key;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_lock_timing(mut self, ttl: Duration, heartbeat: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_heartbeat = heartbeat;
        self
    }

    pub fn with_manifest_page_size(mut self, size: u32) -> Self {
        self.manifest_page_size = size;
        self
    }

    pub fn with_cycle_utc_offset(mut self, minutes: i32) -> Self {
        self.cycle_utc_offset_minutes = minutes;
        self
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}={raw:?}")))
        .transpose()
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;
    dir.push("countsync");
    dir.push("offline.db");
    Ok(dir)
}
