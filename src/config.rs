//! Configuration Module
//!
//! Handles the options a cache instance is built from, including loading
//! them from environment variables.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::persistence::PersistentStore;

/// Default namespace for records in a shared store.
pub const DEFAULT_CACHE_NAME: &str = "Default";

/// Default minimum interval between background expiration scans.
pub const DEFAULT_EXPIRATION_SCAN_FREQUENCY: Duration = Duration::from_secs(60);

/// Default share of entries removed by a pressure-triggered compaction.
pub const DEFAULT_COMPACTION_PERCENTAGE: f64 = 0.10;

/// Default capacity of the background work queue.
pub const DEFAULT_WORK_QUEUE_CAPACITY: usize = 1024;

/// Cache configuration.
#[derive(Clone)]
pub struct CacheOptions {
    /// Namespace partitioning this cache's records in the durable store
    pub cache_name: String,
    /// Durable store mirroring the entries; required when persistent
    pub store: Option<Arc<dyn PersistentStore>>,
    /// Time source for expiration decisions
    pub clock: Arc<dyn Clock>,
    /// Compact automatically once `size_limit` is exceeded
    pub compact_on_memory_pressure: bool,
    /// Entry count above which the cache is under pressure
    pub size_limit: Option<usize>,
    /// Share of entries a pressure-triggered compaction removes
    pub compaction_percentage: f64,
    /// Minimum time between two background expiration scans
    pub expiration_scan_frequency: Duration,
    /// Mirror entries to the store; false gives a purely in-memory cache
    pub is_persistent: bool,
    /// Capacity of the background work queue
    pub work_queue_capacity: usize,
}

impl CacheOptions {
    /// Options for a cache persisted to `store` under `cache_name`.
    pub fn new(cache_name: impl Into<String>, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            cache_name: cache_name.into(),
            store: Some(store),
            is_persistent: true,
            ..Self::in_memory()
        }
    }

    /// Options for a cache that never touches a durable store.
    pub fn in_memory() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            store: None,
            clock: Arc::new(SystemClock),
            compact_on_memory_pressure: true,
            size_limit: None,
            compaction_percentage: DEFAULT_COMPACTION_PERCENTAGE,
            expiration_scan_frequency: DEFAULT_EXPIRATION_SCAN_FREQUENCY,
            is_persistent: false,
            work_queue_capacity: DEFAULT_WORK_QUEUE_CAPACITY,
        }
    }

    /// Loads options from environment variables, persisting to `store` when given.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Store namespace (default: "Default")
    /// - `EXPIRATION_SCAN_FREQUENCY_SECS` - Scan interval in seconds (default: 60)
    /// - `COMPACT_ON_MEMORY_PRESSURE` - Auto-compaction switch (default: true)
    /// - `SIZE_LIMIT` - Entry count considered pressure (default: unset)
    /// - `COMPACTION_PERCENTAGE` - Share removed under pressure (default: 0.10)
    /// - `IS_PERSISTENT` - Mirror to the store (default: true when a store is given)
    /// - `WORK_QUEUE_CAPACITY` - Background queue capacity (default: 1024)
    pub fn from_env(store: Option<Arc<dyn PersistentStore>>) -> Self {
        let has_store = store.is_some();
        let defaults = Self::in_memory();

        Self {
            cache_name: env::var("CACHE_NAME").unwrap_or(defaults.cache_name),
            store,
            clock: defaults.clock,
            compact_on_memory_pressure: env_parse("COMPACT_ON_MEMORY_PRESSURE")
                .unwrap_or(defaults.compact_on_memory_pressure),
            size_limit: env_parse("SIZE_LIMIT"),
            compaction_percentage: env_parse("COMPACTION_PERCENTAGE")
                .unwrap_or(defaults.compaction_percentage),
            expiration_scan_frequency: env_parse("EXPIRATION_SCAN_FREQUENCY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expiration_scan_frequency),
            is_persistent: env_parse("IS_PERSISTENT").unwrap_or(has_store),
            work_queue_capacity: env_parse("WORK_QUEUE_CAPACITY")
                .unwrap_or(defaults.work_queue_capacity),
        }
    }

    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiration_scan_frequency(mut self, frequency: Duration) -> Self {
        self.expiration_scan_frequency = frequency;
        self
    }

    pub fn with_size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = Some(size_limit);
        self
    }

    pub fn with_compaction_percentage(mut self, percentage: f64) -> Self {
        self.compaction_percentage = percentage;
        self
    }

    pub fn with_compact_on_memory_pressure(mut self, enabled: bool) -> Self {
        self.compact_on_memory_pressure = enabled;
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.is_persistent = enabled;
        self
    }

    pub fn with_work_queue_capacity(mut self, capacity: usize) -> Self {
        self.work_queue_capacity = capacity;
        self
    }

    /// Checks the options for contradictions before a cache is built.
    pub fn validate(&self) -> Result<()> {
        if self.is_persistent && self.store.is_none() {
            return Err(CacheError::InvalidArgument(
                "persistence is enabled but no store was configured".to_string(),
            ));
        }
        if self.expiration_scan_frequency.is_zero() {
            return Err(CacheError::InvalidArgument(
                "the expiration scan frequency must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_percentage) {
            return Err(CacheError::InvalidArgument(format!(
                "compaction percentage {} is outside [0, 1]",
                self.compaction_percentage
            )));
        }
        if self.work_queue_capacity == 0 {
            return Err(CacheError::InvalidArgument(
                "the work queue capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("cache_name", &self.cache_name)
            .field("has_store", &self.store.is_some())
            .field("compact_on_memory_pressure", &self.compact_on_memory_pressure)
            .field("size_limit", &self.size_limit)
            .field("compaction_percentage", &self.compaction_percentage)
            .field("expiration_scan_frequency", &self.expiration_scan_frequency)
            .field("is_persistent", &self.is_persistent)
            .field("work_queue_capacity", &self.work_queue_capacity)
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
