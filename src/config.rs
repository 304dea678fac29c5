//! Storage configuration
//!
//! Loaded from TOML. Selects the data store and cache store by descriptor and
//! carries the deadlines every backend call is bounded by.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::NeighborCache;
use crate::data::{router, Backend};
use crate::kv::redis::RedisTimeouts;

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub cache: CacheNamespaces,
}

/// Where data and cache live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Descriptor of the users/items/feedback store
    #[serde(default = "default_data_store")]
    pub data_store: String,

    /// Descriptor of the neighbor cache (key-value only)
    #[serde(default = "default_cache_store")]
    pub cache_store: String,

    /// Prepended to table names of relational stores
    #[serde(default)]
    pub table_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_store: default_data_store(),
            cache_store: default_cache_store(),
            table_prefix: String::new(),
        }
    }
}

fn default_data_store() -> String {
    "sqlite://recstore.db".to_string()
}

fn default_cache_store() -> String {
    "memory://".to_string()
}

/// Deadlines in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bounds adapter construction
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Bounds each call and each stream batch fetch
    #[serde(default = "default_operation_ms")]
    pub operation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            operation_ms: default_operation_ms(),
        }
    }
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_operation_ms() -> u64 {
    10_000
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn redis(&self) -> RedisTimeouts {
        RedisTimeouts {
            connect: self.connect(),
            operation: self.operation(),
        }
    }
}

/// Key namespaces written by the offline job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheNamespaces {
    #[serde(default = "default_item_neighbors")]
    pub item_neighbors: String,

    #[serde(default = "default_user_neighbors")]
    pub user_neighbors: String,

    #[serde(default = "default_offline_recommend")]
    pub offline_recommend: String,
}

impl Default for CacheNamespaces {
    fn default() -> Self {
        Self {
            item_neighbors: default_item_neighbors(),
            user_neighbors: default_user_neighbors(),
            offline_recommend: default_offline_recommend(),
        }
    }
}

fn default_item_neighbors() -> String {
    "item_neighbors".to_string()
}

fn default_user_neighbors() -> String {
    "user_neighbors".to_string()
}

fn default_offline_recommend() -> String {
    "offline_recommend".to_string()
}

impl StorageConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::load_from_str(&content)
    }

    /// Load configuration from string
    pub fn load_from_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse storage configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.data_store.is_empty() {
            anyhow::bail!("database.data_store must not be empty");
        }
        if self.database.cache_store.is_empty() {
            anyhow::bail!("database.cache_store must not be empty");
        }
        router::normalize_table_prefix(&self.database.table_prefix)
            .context("Invalid database.table_prefix")?;

        if self.timeouts.connect_ms == 0 || self.timeouts.operation_ms == 0 {
            anyhow::bail!("timeouts must be positive");
        }

        let namespaces = [
            ("item_neighbors", &self.cache.item_neighbors),
            ("user_neighbors", &self.cache.user_neighbors),
            ("offline_recommend", &self.cache.offline_recommend),
        ];
        for (name, value) in namespaces {
            if value.is_empty() {
                anyhow::bail!("cache.{name} must not be empty");
            }
        }
        Ok(())
    }

    /// Open the data store
    pub fn open_database(&self) -> Result<Backend> {
        let descriptor = &self.database.data_store;
        router::open_database(descriptor, &self.database.table_prefix, self)
            .with_context(|| format!("Failed to open data store {descriptor}"))
    }

    /// Open the neighbor cache
    pub fn open_cache(&self) -> Result<NeighborCache> {
        let descriptor = &self.database.cache_store;
        let store = router::open_kv_store(descriptor, &self.timeouts)
            .with_context(|| format!("Failed to open cache store {descriptor}"))?;
        Ok(NeighborCache::new(store, self.cache.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.database.data_store, "sqlite://recstore.db");
        assert_eq!(config.database.cache_store, "memory://");
        assert_eq!(config.timeouts.operation(), Duration::from_secs(10));
        assert_eq!(config.cache.item_neighbors, "item_neighbors");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [database]
            data_store = "sqlite:///var/lib/recstore/data.db"
            cache_store = "redis://127.0.0.1:6379/0"
            table_prefix = "rec"

            [timeouts]
            connect_ms = 1000
            operation_ms = 2000

            [cache]
            item_neighbors = "neighbors"
        "#;

        let config = StorageConfig::load_from_str(toml).unwrap();
        assert_eq!(config.database.cache_store, "redis://127.0.0.1:6379/0");
        assert_eq!(config.database.table_prefix, "rec");
        assert_eq!(config.timeouts.connect(), Duration::from_secs(1));
        assert_eq!(config.cache.item_neighbors, "neighbors");
        // untouched keys keep their defaults
        assert_eq!(config.cache.offline_recommend, "offline_recommend");
    }

    #[test]
    fn test_validate_zero_timeout() {
        let toml = r#"
            [timeouts]
            operation_ms = 0
        "#;

        let result = StorageConfig::load_from_str(toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timeouts"));
    }

    #[test]
    fn test_validate_bad_prefix() {
        let toml = r#"
            [database]
            table_prefix = "rec-"
        "#;

        let result = StorageConfig::load_from_str(toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("table_prefix"));
    }

    #[test]
    fn test_validate_empty_namespace() {
        let toml = r#"
            [cache]
            user_neighbors = ""
        "#;

        let result = StorageConfig::load_from_str(toml);
        assert!(result.unwrap_err().to_string().contains("cache.user_neighbors"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("recstore.toml");
        std::fs::write(&path, "[database]\ndata_store = \"memory://\"\n").unwrap();

        let config = StorageConfig::load_from_file(&path).unwrap();
        assert_eq!(config.database.data_store, "memory://");

        let missing = StorageConfig::load_from_file(temp.path().join("missing.toml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_open_from_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = StorageConfig::default();
        config.database.data_store = format!("sqlite://{}", temp.path().join("d.db").display());
        config.database.table_prefix = "t".to_string();

        let db = config.open_database().unwrap();
        assert_eq!(db.backend_name(), "sqlite");
        let cache = config.open_cache().unwrap();
        assert!(cache.get_neighbors("1", 10).unwrap().is_empty());
    }
}
