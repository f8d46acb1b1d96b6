//! Cache configuration types and defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::pool::Priority;
use crate::constants::cache;
use crate::errors::{CacheError, CacheResult};

/// Configuration for a keyed download cache instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Instance name; also names the persisted completion file
    pub name: String,
    /// Directory holding downloaded files (OS cache directory if None)
    pub cache_root: Option<PathBuf>,
    /// How long a completed download stays fresh (never stale if None)
    pub max_age: Option<Duration>,
    /// Priority used when `get` is called without one
    pub default_priority: Priority,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: cache::DEFAULT_CACHE_NAME.to_string(),
            cache_root: None,
            max_age: None,
            default_priority: Priority::Normal,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for a named cache instance
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the cache directory
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(cache_root.into());
        self
    }

    /// Set the freshness window
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Set the default download priority
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Directory this instance stores its files in
    ///
    /// Uses `cache_root` when set, otherwise
    /// `<os cache dir>/resource-fetcher/<name>`.
    pub fn resolve_cache_dir(&self) -> CacheResult<PathBuf> {
        if let Some(root) = &self.cache_root {
            return Ok(root.clone());
        }

        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| CacheError::DirectoryNotAccessible {
                path: PathBuf::from("system cache directory"),
            })?
            .join(cache::APP_DIR_NAME)
            .join(&self.name);

        Ok(cache_dir)
    }
}
