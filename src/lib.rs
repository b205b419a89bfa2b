//! Persistent Cache - An in-process key/value cache that survives restarts
//!
//! Entries expire by absolute deadline, sliding idle time, or external change
//! tokens, are compacted by priority and recency, and are mirrored to a
//! durable store that repopulates the cache when it is reopened.

pub mod cache;
pub mod config;
pub mod error;
pub mod persistence;
pub mod tasks;

pub use cache::{
    CachePriority, CacheStats, CancellationChangeToken, ChangeToken, EntryDraft, EvictionReason,
    ManualClock, PersistentCache,
};
pub use config::CacheOptions;
pub use error::{CacheError, Result};
pub use persistence::{DurableRecord, MemoryStore, PersistentStore, SqliteStore};
pub use tasks::spawn_expiration_task;
