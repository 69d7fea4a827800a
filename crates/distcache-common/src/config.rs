//! Configuration types for distcache
//!
//! All sections have defaults, so an empty TOML file is a valid config.
//! Durations are written in humantime form (`"15m"`, `"90s"`).

use crate::error::{Error, Result};
use crate::types::{CachePolicy, UPDATE_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for distcache
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Persistence configuration
    pub store: StoreConfig,
    /// Front cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the stores and reapers cannot run with
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        if self.cache.front_capacity == 0 {
            return Err(Error::configuration("cache.front_capacity must be positive"));
        }
        Ok(())
    }

    /// Load a TOML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Path of the backing database file
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("distcache").join("distcache.redb")
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Server id used in log lines and store names
    pub server_id: String,
    /// Data directory for the backing database
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "default".to_string(),
            data_dir: PathBuf::from("./distcache-data"),
        }
    }
}

/// Which persistence layout backs the cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingKind {
    /// Split metadata table plus content-addressed blob table
    #[default]
    Split,
    /// Single legacy cache-map table plus blob table
    Legacy,
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backing layout
    pub backing: BackingKind,
    /// How long an unreferenced blob survives
    #[serde(with = "humantime_serde")]
    pub data_expire_timeout: Duration,
    /// Interval of the metadata expiration sweep
    #[serde(with = "humantime_serde")]
    pub mnode_reaper_interval: Duration,
    /// Interval of the legacy cache-map expiration sweep
    #[serde(with = "humantime_serde")]
    pub legacy_reaper_interval: Duration,
    /// Rows per change-feed page
    pub update_batch_size: usize,
}

impl StoreConfig {
    /// Reaper intervals must be non-zero, and the blob reaper runs at half
    /// the blob expiry
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("store.data_expire_timeout", self.data_reaper_interval()),
            ("store.mnode_reaper_interval", self.mnode_reaper_interval),
            ("store.legacy_reaper_interval", self.legacy_reaper_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(Error::configuration(format!("{name} is too short: {interval:?}")));
            }
        }
        if self.update_batch_size == 0 {
            return Err(Error::configuration("store.update_batch_size must be positive"));
        }
        Ok(())
    }

    /// Blob sweeps run at half the blob expiry so a referenced blob is
    /// always extended before it lapses
    #[must_use]
    pub fn data_reaper_interval(&self) -> Duration {
        self.data_expire_timeout / 2
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backing: BackingKind::Split,
            data_expire_timeout: Duration::from_secs(15 * 60),
            mnode_reaper_interval: Duration::from_secs(15 * 60),
            legacy_reaper_interval: Duration::from_secs(5 * 60),
            update_batch_size: UPDATE_BATCH_SIZE,
        }
    }
}

/// Front cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held in the in-process LRU
    pub front_capacity: usize,
    /// Deflate level, 0-9
    pub compression_level: u32,
    /// Default idle timeout; `None` never expires
    #[serde(with = "humantime_serde")]
    pub access_timeout: Option<Duration>,
    /// Default absolute timeout; `None` never expires
    #[serde(with = "humantime_serde")]
    pub modified_timeout: Option<Duration>,
    /// Default entry flags
    pub flags: u64,
}

impl CacheConfig {
    /// Default policy for entries written without an explicit one
    #[must_use]
    pub fn default_policy(&self) -> CachePolicy {
        let mut policy = CachePolicy::default().with_flags(self.flags);
        if let Some(timeout) = self.access_timeout {
            policy = policy.with_access_timeout(timeout);
        }
        if let Some(timeout) = self.modified_timeout {
            policy = policy.with_modified_timeout(timeout);
        }
        policy
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            front_capacity: 8 * 1024,
            compression_level: 6,
            access_timeout: None,
            modified_timeout: None,
            flags: 0,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FLAG_TRIPLICATE, NO_TIMEOUT};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.node.server_id, "default");
        assert_eq!(config.store.backing, BackingKind::Split);
        assert_eq!(config.store.data_expire_timeout, Duration::from_secs(900));
        assert_eq!(config.store.data_reaper_interval(), Duration::from_secs(450));
        assert_eq!(config.cache.front_capacity, 8192);
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::from_toml(
            r#"
            [node]
            server_id = "app-a"
            data_dir = "/tmp/dc"

            [store]
            backing = "legacy"
            data_expire_timeout = "30m"
            legacy_reaper_interval = "1m"

            [cache]
            front_capacity = 16
            access_timeout = "90s"
            flags = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.node.server_id, "app-a");
        assert_eq!(config.store.backing, BackingKind::Legacy);
        assert_eq!(config.store.data_expire_timeout, Duration::from_secs(1800));
        assert_eq!(config.store.legacy_reaper_interval, Duration::from_secs(60));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/dc/distcache/distcache.redb")
        );

        let policy = config.cache.default_policy();
        assert_eq!(policy.access_timeout, 90_000);
        assert_eq!(policy.modified_timeout, NO_TIMEOUT);
        assert_eq!(policy.flags, FLAG_TRIPLICATE);
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let err = Config::from_toml("[store]\nupdate_batch_size = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for doc in [
            "[store]\ndata_expire_timeout = \"0s\"",
            "[store]\nmnode_reaper_interval = \"0s\"",
            "[store]\nlegacy_reaper_interval = \"0s\"",
            "[store]\nupdate_batch_size = 0",
            "[cache]\nfront_capacity = 0",
        ] {
            let err = Config::from_toml(doc).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{doc} gave {err}");
        }
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[store]\ndata_expire_timeout = \"0s\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
