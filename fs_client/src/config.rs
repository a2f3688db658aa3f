use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blockfs_lib::{BfsError, BfsResult, StoreBackend, DEFAULT_BLOCK_SIZE};

pub const DEFAULT_STATUS_TTL_MS: u64 = 30_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_BLOCK_BUFFER_COUNT: usize = 10;
pub const DEFAULT_LOCAL_READ_FAIL_LIMIT: u32 = 5;

/// Client-side tuning knobs. Every field has a default, so an empty JSON
/// object is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(alias = "backend")]
    pub store_backend: StoreBackend,
    /// Block size for files this client creates.
    #[serde(alias = "create_block_size")]
    pub block_size: u64,
    /// Metadata cache TTL in milliseconds, 0 keeps entries until invalidated.
    #[serde(alias = "status_cache_ttl_ms", alias = "status_ttl")]
    pub status_ttl_ms: u64,
    /// Lease renewal period of the per-handle keepalive task.
    #[serde(alias = "lease_keepalive_ms", alias = "keepalive_ms")]
    pub keepalive_interval_ms: u64,
    /// Per-reader capacity of the block buffer cache.
    #[serde(alias = "read_buffer_count")]
    pub block_buffer_count: usize,
    /// Consecutive local-read failures after which a handle stops trying the
    /// co-located block cache.
    #[serde(alias = "local_fail_limit")]
    pub local_read_fail_limit: u32,
    /// Root of the co-located block cache. `None` disables the local fast
    /// path entirely.
    #[serde(alias = "block_cache_dir", alias = "local_cache_dir")]
    pub local_cache_root: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            block_size: DEFAULT_BLOCK_SIZE,
            status_ttl_ms: DEFAULT_STATUS_TTL_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            block_buffer_count: DEFAULT_BLOCK_BUFFER_COUNT,
            local_read_fail_limit: DEFAULT_LOCAL_READ_FAIL_LIMIT,
            local_cache_root: None,
        }
    }
}

impl ClientConfig {
    pub fn check(&self) -> BfsResult<()> {
        if self.block_size == 0 {
            return Err(BfsError::InvalidParam(
                "block_size must be positive".to_string(),
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(BfsError::InvalidParam(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.block_buffer_count == 0 {
            return Err(BfsError::InvalidParam(
                "block_buffer_count must be at least 1".to_string(),
            ));
        }
        if self.local_read_fail_limit == 0 {
            return Err(BfsError::InvalidParam(
                "local_read_fail_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> BfsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BfsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BfsError::InvalidData(format!("parse {} failed: {}", path.display(), e)))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json_value(value: serde_json::Value) -> BfsResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| BfsError::InvalidData(format!("parse client config failed: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// `None` when the TTL is 0, which means entries never expire by time.
    pub fn status_ttl(&self) -> Option<Duration> {
        if self.status_ttl_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.status_ttl_ms))
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        config.check().unwrap();
        assert_eq!(config.status_ttl_ms, 30_000);
        assert_eq!(config.keepalive_interval_ms, 60_000);
        assert_eq!(config.block_buffer_count, 10);
        assert_eq!(config.local_read_fail_limit, 5);
        assert!(config.local_cache_root.is_none());
        assert_eq!(config.status_ttl(), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn test_from_json_with_aliases() {
        let config = ClientConfig::from_json_value(serde_json::json!({
            "backend": "memory",
            "status_ttl": 1000,
            "keepalive_ms": 5000,
            "read_buffer_count": 4,
            "local_cache_dir": "/var/cache/blockfs",
        }))
        .unwrap();
        assert_eq!(config.status_ttl_ms, 1000);
        assert_eq!(config.keepalive_interval_ms, 5000);
        assert_eq!(config.block_buffer_count, 4);
        assert_eq!(
            config.local_cache_root,
            Some(PathBuf::from("/var/cache/blockfs"))
        );

        let empty = ClientConfig::from_json_value(serde_json::json!({})).unwrap();
        assert_eq!(empty.block_buffer_count, 10);
    }

    #[test]
    fn test_check_rejects_zero_knobs() {
        let mut config = ClientConfig::default();
        config.block_buffer_count = 0;
        assert!(config.check().is_err());

        let mut config = ClientConfig::default();
        config.keepalive_interval_ms = 0;
        assert!(config.check().is_err());

        let mut config = ClientConfig::default();
        config.status_ttl_ms = 0;
        config.check().unwrap();
        assert_eq!(config.status_ttl(), None);
    }
}
