//! Loader configuration
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! cache_root = "./cache"
//! max_concurrent_network = 4
//! max_disk_ops_per_tick = 10
//! default_timeout_secs = 30     # 0 disables the timeout
//! image_catalog_save_delay_ticks = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LoaderError, LoaderResult};

/// Configuration for the request scheduler and image cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Root directory owned by the loader (manifest, cached payloads, images)
    pub cache_root: PathBuf,
    /// Maximum transport fetches in flight at once
    pub max_concurrent_network: usize,
    /// Maximum direct file reads started per tick
    pub max_disk_ops_per_tick: usize,
    /// Timeout applied to requests that do not set their own (0 = none)
    pub default_timeout_secs: u64,
    /// Ticks to wait before saving a dirty image catalog
    pub image_catalog_save_delay_ticks: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("./cache"),
            max_concurrent_network: 4,
            max_disk_ops_per_tick: 10,
            default_timeout_secs: 30,
            image_catalog_save_delay_ticks: 60,
        }
    }
}

impl LoaderConfig {
    /// Config for development (local directory, short timeout)
    pub fn development() -> Self {
        Self {
            cache_root: PathBuf::from("./cache"),
            default_timeout_secs: 10,
            ..Default::default()
        }
    }

    /// Config for tests rooted at the given directory
    pub fn testing(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: root.into(),
            default_timeout_secs: 5,
            image_catalog_save_delay_ticks: 1,
            ..Default::default()
        }
    }

    /// Parse a config from a TOML string
    pub fn from_toml_str(content: &str) -> LoaderResult<Self> {
        let config: LoaderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> LoaderResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject budgets that would stall the scheduler
    pub fn validate(&self) -> LoaderResult<()> {
        if self.max_concurrent_network == 0 {
            return Err(LoaderError::Config(
                "max_concurrent_network must be at least 1".to_string(),
            ));
        }
        if self.max_disk_ops_per_tick == 0 {
            return Err(LoaderError::Config(
                "max_disk_ops_per_tick must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default timeout as a duration, `None` when disabled
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}
