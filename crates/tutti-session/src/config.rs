//! Session configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use tutti_store::{ContentStore, DEFAULT_CHUNK_SIZE, DEFAULT_RETENTION};

use crate::error::Result;

/// Service id leaders advertise and followers search for.
pub const DEFAULT_SERVICE_ID: &str = "tutti.score-sync";

/// How long a follower searches before giving up.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Configuration for a session coordinator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name shown to other devices.
    pub device_name: String,

    /// Advertised/discovered service id. Must match across the group.
    pub service_id: String,

    /// Discovery gives up after this long without a leader.
    pub discovery_timeout: Duration,

    /// Content store directory.
    pub cache_dir: PathBuf,

    /// Cached files not read for this long are evicted.
    pub cache_retention: Duration,

    /// Read size used while hashing.
    pub hash_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: "Tutti device".to_string(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            cache_dir: PathBuf::from("./tutti-cache"),
            cache_retention: DEFAULT_RETENTION,
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let device_name = lookup("TUTTI_DEVICE_NAME")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.device_name);

        let service_id = lookup("TUTTI_SERVICE_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.service_id);

        let discovery_timeout = parse_var(&lookup, "TUTTI_DISCOVERY_TIMEOUT_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.discovery_timeout);

        let cache_dir = lookup("TUTTI_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let cache_retention = parse_var(&lookup, "TUTTI_CACHE_RETENTION_DAYS")
            .and_then(|days: u64| match days.checked_mul(SECS_PER_DAY) {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => {
                    warn!(days, "TUTTI_CACHE_RETENTION_DAYS out of range, using default");
                    None
                }
            })
            .unwrap_or(defaults.cache_retention);

        let hash_chunk_size = parse_var(&lookup, "TUTTI_HASH_CHUNK_SIZE")
            .filter(|size: &usize| *size > 0)
            .unwrap_or(defaults.hash_chunk_size);

        Self {
            device_name,
            service_id,
            discovery_timeout,
            cache_dir,
            cache_retention,
            hash_chunk_size,
        }
    }

    /// Open the content store this config describes.
    pub async fn open_store(&self) -> Result<ContentStore> {
        let store = ContentStore::open(&self.cache_dir)
            .await?
            .with_chunk_size(self.hash_chunk_size)
            .with_retention(self.cache_retention);
        Ok(store)
    }

    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    #[must_use]
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_cache_retention(mut self, retention: Duration) -> Self {
        self.cache_retention = retention;
        self
    }

    #[must_use]
    pub fn with_hash_chunk_size(mut self, size: usize) -> Self {
        self.hash_chunk_size = size.max(1);
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid setting");
            None
        }
    }
}
