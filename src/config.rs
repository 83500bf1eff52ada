//! Cache configuration.
//!
//! Defines window width, shard layout and the bucket pool limits.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest window width (in time units) a cache accepts.
pub const MIN_TTL: u64 = 16;

/// Largest `max_windows` a cache accepts.
pub const MAX_WINDOWS_LIMIT: usize = 1 << 16;

/// Default number of writable windows.
pub const DEFAULT_MAX_WINDOWS: usize = 8;

/// Default number of buckets pre-built into the free pool.
pub const DEFAULT_POPULATION: usize = 16;

/// Default advisory capacity of one shard.
pub const DEFAULT_SHARD_CAPACITY: usize = 1024 * 1024;

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// Time-to-live in time units. Rounded down to a power of two, this is
    /// the width of one window.
    pub ttl: u64,

    /// Advisory capacity of every shard.
    /// Default: 1M entries
    pub shard_capacity: usize,

    /// Shards per bucket.
    /// Default: hardware concurrency
    pub shards: usize,

    /// Windows kept writable behind the current baseline, current included.
    /// Default: 8
    pub max_windows: usize,

    /// Buckets pre-built at construction.
    /// Default: 16
    pub population: usize,

    /// Hard cap on buckets ever allocated. `None` lets the pool grow
    /// without bound.
    pub max_buckets: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: 1 << 30,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            shards: hardware_concurrency(),
            max_windows: DEFAULT_MAX_WINDOWS,
            population: DEFAULT_POPULATION,
            max_buckets: None,
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: u64) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_max_windows(mut self, max_windows: usize) -> Self {
        self.max_windows = max_windows;
        self
    }

    pub fn with_population(mut self, population: usize) -> Self {
        self.population = population;
        self
    }

    pub fn with_shard_capacity(mut self, shard_capacity: usize) -> Self {
        self.shard_capacity = shard_capacity;
        self
    }

    pub fn with_max_buckets(mut self, max_buckets: Option<usize>) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// log2 of the window width, i.e. `floor(log2(ttl))`.
    pub fn shift(&self) -> u32 {
        if self.ttl == 0 {
            0
        } else {
            63 - self.ttl.leading_zeros()
        }
    }

    /// Checks the configuration and returns the window shift.
    pub fn validate(&self) -> Result<u32> {
        if self.ttl == 0 {
            return Err(Error::InvalidConfig("ttl must be positive".to_string()));
        }
        let shift = self.shift();
        if (1u64 << shift) < MIN_TTL {
            return Err(Error::InvalidConfig(format!(
                "ttl {} is too small, window width must be at least {MIN_TTL}",
                self.ttl
            )));
        }
        if self.shards == 0 {
            return Err(Error::InvalidConfig("shards must be positive".to_string()));
        }
        if self.max_windows == 0 {
            return Err(Error::InvalidConfig(
                "max_windows must be positive".to_string(),
            ));
        }
        if self.max_windows > MAX_WINDOWS_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_windows {} exceeds the limit {MAX_WINDOWS_LIMIT}",
                self.max_windows
            )));
        }
        if let Some(limit) = self.max_buckets {
            // A full slide needs max_windows buckets, plus one for the seed window.
            let floor = self.population.max(self.max_windows + 1);
            if limit < floor {
                return Err(Error::InvalidConfig(format!(
                    "max_buckets {limit} is below the required minimum {floor}"
                )));
            }
        }
        Ok(shift)
    }
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.max_windows, 8);
        assert_eq!(config.population, 16);
        assert!(config.shards >= 1);
        assert_eq!(config.max_buckets, None);
        assert_eq!(config.validate(), Ok(30));
    }

    #[test]
    fn test_shift_rounds_down() {
        assert_eq!(CacheConfig::new(64).shift(), 6);
        assert_eq!(CacheConfig::new(100).shift(), 6);
        assert_eq!(CacheConfig::new(128).shift(), 7);
    }

    #[test]
    fn test_ttl_too_small() {
        let err = CacheConfig::new(8).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(CacheConfig::new(0).validate().is_err());
        assert_eq!(CacheConfig::new(MIN_TTL).validate(), Ok(4));
    }

    #[test]
    fn test_rejects_degenerate_layout() {
        assert!(CacheConfig::new(64).with_shards(0).validate().is_err());
        assert!(CacheConfig::new(64).with_max_windows(0).validate().is_err());
        assert!(CacheConfig::new(64)
            .with_max_windows(MAX_WINDOWS_LIMIT)
            .validate()
            .is_ok());
        assert!(CacheConfig::new(64)
            .with_max_windows(usize::MAX)
            .validate()
            .is_err());
        let capped = CacheConfig::new(64)
            .with_max_windows(4)
            .with_population(2)
            .with_max_buckets(Some(4));
        assert!(capped.validate().is_err());
        assert!(capped.with_max_buckets(Some(5)).validate().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"ttl": 64, "shards": 2}"#).expect("parse config");
        assert_eq!(config.ttl, 64);
        assert_eq!(config.shards, 2);
        assert_eq!(config.max_windows, DEFAULT_MAX_WINDOWS);
    }
}
