//! Cache configuration
//!
//! Loaded from TOML, every field optional:
//!
//! ```toml
//! max_age_secs = 10.0
//! batched_max_age_ticks = 1000
//! sampler_capacity = 100
//! sampler_max_age_ticks = 250
//! min_block_size = 256
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};
use crate::memory::is_power_of_two;

/// Tunables shared by the caches and allocators
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds a line of the async cache may go unused before eviction
    pub max_age_secs: f32,

    /// Ticks before a batched cache line becomes eligible for `evict()`
    pub batched_max_age_ticks: u64,

    /// Size of the shader-visible sampler array
    pub sampler_capacity: usize,

    /// Ticks before an unused sampler handle is recycled. Must stay shorter
    /// than the texture cache lifetime so handles never outlive their texture.
    pub sampler_max_age_ticks: u64,

    /// Smallest block the buddy allocator hands out
    pub min_block_size: u64,

    /// Prefix for background worker thread names
    pub worker_name_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 10.0,
            batched_max_age_ticks: 1000,
            sampler_capacity: 100,
            sampler_max_age_ticks: 250,
            min_block_size: 256,
            worker_name_prefix: "cache".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_toml_str(raw: &str) -> CacheResult<Self> {
        let config: CacheConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        log::info!("[CacheConfig] Loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if !(self.max_age_secs.is_finite() && self.max_age_secs > 0.0) {
            return Err(config_error(format!(
                "max_age_secs must be positive, got {}",
                self.max_age_secs
            )));
        }
        if self.sampler_capacity == 0 {
            return Err(config_error("sampler_capacity must be at least 1"));
        }
        if !is_power_of_two(self.min_block_size) {
            return Err(config_error(format!(
                "min_block_size must be a power of two, got {}",
                self.min_block_size
            )));
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs_f32(self.max_age_secs)
    }

    pub fn worker_name(&self, backend: &str) -> String {
        format!("{}:{}", self.worker_name_prefix, backend)
    }
}

fn config_error(message: impl Into<String>) -> CacheError {
    CacheError::Config {
        message: message.into(),
    }
}
