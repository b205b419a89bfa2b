//! SQLite durable store.
//!
//! One table shared by every cache namespace, indexed by namespace.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::cache::CachePriority;
use crate::persistence::{DurableRecord, PersistentStore, RecordId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persisted_cache_entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    priority TEXT NOT NULL,
    value TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    absolute_expiration TEXT,
    sliding_expiration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_persisted_cache_entry_cache_name
    ON persisted_cache_entry (cache_name);
";

const SELECT_COLUMNS: &str = "SELECT id, cache_name, cache_key, priority, value, last_accessed, \
     absolute_expiration, sliding_expiration_ms FROM persisted_cache_entry";

/// A [`PersistentStore`] backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening sqlite cache store");
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// == Row Conversion ==
struct RawRecord {
    id: RecordId,
    cache_name: String,
    cache_key: String,
    priority: String,
    value: String,
    last_accessed: String,
    absolute_expiration: Option<String>,
    sliding_expiration_ms: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cache_name: row.get(1)?,
            cache_key: row.get(2)?,
            priority: row.get(3)?,
            value: row.get(4)?,
            last_accessed: row.get(5)?,
            absolute_expiration: row.get(6)?,
            sliding_expiration_ms: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<DurableRecord> {
        let sliding_expiration = match self.sliding_expiration_ms {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            Some(ms) => {
                return Err(CacheError::Store(format!(
                    "record {} has non-positive sliding expiration {ms}ms",
                    self.id
                )))
            }
            None => None,
        };

        let id = self.id;
        let corrupt = |column: &str, e: String| {
            CacheError::Store(format!("record {id} has an unreadable {column} column: {e}"))
        };

        Ok(DurableRecord {
            id: Some(id),
            cache_name: self.cache_name,
            key: serde_json::from_str(&self.cache_key)
                .map_err(|e| corrupt("cache_key", e.to_string()))?,
            priority: self
                .priority
                .parse::<CachePriority>()
                .map_err(|e| corrupt("priority", e.to_string()))?,
            value: serde_json::from_str(&self.value)
                .map_err(|e| corrupt("value", e.to_string()))?,
            last_accessed: parse_instant(&self.last_accessed)?,
            absolute_expiration: self
                .absolute_expiration
                .as_deref()
                .map(parse_instant)
                .transpose()?,
            sliding_expiration,
        })
    }
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| CacheError::Store(format!("invalid timestamp {text:?}: {e}")))
}

fn sliding_millis(record: &DurableRecord) -> Option<i64> {
    record
        .sliding_expiration
        .map(|sliding| i64::try_from(sliding.as_millis()).unwrap_or(i64::MAX).max(1))
}

impl PersistentStore for SqliteStore {
    fn create(&self, record: &DurableRecord) -> Result<RecordId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO persisted_cache_entry (cache_name, cache_key, priority, value, \
             last_accessed, absolute_expiration, sliding_expiration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.cache_name,
                serde_json::to_string(&record.key)?,
                record.priority.as_str(),
                serde_json::to_string(&record.value)?,
                record.last_accessed.to_rfc3339(),
                record.absolute_expiration.map(|instant| instant.to_rfc3339()),
                sliding_millis(record),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn load(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                RawRecord::from_row,
            )
            .optional()?
        };
        raw.map(RawRecord::into_record).transpose()
    }

    fn load_all(&self, cache_name: &str) -> Result<Vec<DurableRecord>> {
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE cache_name = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![cache_name], RawRecord::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let records = raws
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id;
                match raw.into_record() {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(id, error = %e, "skipping corrupt cache record");
                        None
                    }
                }
            })
            .collect();
        Ok(records)
    }

    fn update(&self, id: RecordId, record: &DurableRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE persisted_cache_entry SET cache_name = ?1, cache_key = ?2, priority = ?3, \
             value = ?4, last_accessed = ?5, absolute_expiration = ?6, sliding_expiration_ms = ?7 \
             WHERE id = ?8",
            params![
                record.cache_name,
                serde_json::to_string(&record.key)?,
                record.priority.as_str(),
                serde_json::to_string(&record.value)?,
                record.last_accessed.to_rfc3339(),
                record.absolute_expiration.map(|instant| instant.to_rfc3339()),
                sliding_millis(record),
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn remove(&self, id: RecordId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM persisted_cache_entry WHERE id = ?1", params![id])?;
        Ok(())
    }
}
