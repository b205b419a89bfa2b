//! Persistence Module
//!
//! The contract the cache engine uses to mirror entries into a durable store,
//! plus the stores shipped with the crate.

mod memory;
mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CachePriority;
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store-assigned identifier of a durable record.
pub type RecordId = i64;

// == Durable Record ==
/// The persisted mirror of one committed cache entry.
///
/// Key and value are carried as opaque JSON payloads; the engine converts
/// them back to its typed keys and values on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    /// Assigned by the store on `create`; `None` on records not yet stored.
    pub id: Option<RecordId>,
    /// Namespace partitioning records of different caches in one store
    pub cache_name: String,
    pub key: serde_json::Value,
    pub priority: CachePriority,
    pub value: serde_json::Value,
    pub last_accessed: DateTime<Utc>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_expiration: Option<Duration>,
}

// == Persistent Store ==
/// Durable backing store for cache entries.
///
/// Implementations must be safe to call from several threads; the engine
/// calls `create`/`remove` while holding its table lock, so calls should not
/// block for long.
pub trait PersistentStore: Send + Sync {
    /// Inserts a new record and returns its identifier.
    fn create(&self, record: &DurableRecord) -> Result<RecordId>;

    /// Loads a single record.
    fn load(&self, id: RecordId) -> Result<Option<DurableRecord>>;

    /// Loads every record of a namespace, in ascending id order.
    fn load_all(&self, cache_name: &str) -> Result<Vec<DurableRecord>>;

    /// Overwrites an existing record. Returns false if no such record exists.
    fn update(&self, id: RecordId, record: &DurableRecord) -> Result<bool>;

    /// Deletes a record. Deleting a missing record is not an error.
    fn remove(&self, id: RecordId) -> Result<()>;
}
