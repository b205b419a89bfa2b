//! In-process durable store.
//!
//! Keeps records for as long as the store itself lives, so an `Arc` of it can
//! be handed to successive cache instances to simulate a restart.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::persistence::{DurableRecord, PersistentStore, RecordId};

#[derive(Debug, Default)]
struct Records {
    next_id: RecordId,
    by_id: BTreeMap<RecordId, DurableRecord>,
}

/// A [`PersistentStore`] backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all namespaces.
    pub fn len(&self) -> usize {
        self.records.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().by_id.is_empty()
    }
}

impl PersistentStore for MemoryStore {
    fn create(&self, record: &DurableRecord) -> Result<RecordId> {
        let mut records = self.records.lock();
        records.next_id += 1;
        let id = records.next_id;

        let mut stored = record.clone();
        stored.id = Some(id);
        records.by_id.insert(id, stored);
        Ok(id)
    }

    fn load(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        Ok(self.records.lock().by_id.get(&id).cloned())
    }

    fn load_all(&self, cache_name: &str) -> Result<Vec<DurableRecord>> {
        Ok(self
            .records
            .lock()
            .by_id
            .values()
            .filter(|record| record.cache_name == cache_name)
            .cloned()
            .collect())
    }

    fn update(&self, id: RecordId, record: &DurableRecord) -> Result<bool> {
        let mut records = self.records.lock();
        match records.by_id.get_mut(&id) {
            Some(existing) => {
                *existing = record.clone();
                existing.id = Some(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, id: RecordId) -> Result<()> {
        self.records.lock().by_id.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePriority;
    use chrono::Utc;
    use serde_json::json;

    fn record(cache_name: &str, key: &str) -> DurableRecord {
        DurableRecord {
            id: None,
            cache_name: cache_name.to_string(),
            key: json!(key),
            priority: CachePriority::Normal,
            value: json!({"n": 1}),
            last_accessed: Utc::now(),
            absolute_expiration: None,
            sliding_expiration: None,
        }
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.create(&record("c", "a")).unwrap();
        let b = store.create(&record("c", "b")).unwrap();
        assert!(b > a);
        assert_eq!(store.load(a).unwrap().unwrap().id, Some(a));
    }

    #[test]
    fn test_load_all_filters_namespace() {
        let store = MemoryStore::new();
        store.create(&record("one", "a")).unwrap();
        store.create(&record("two", "b")).unwrap();
        store.create(&record("one", "c")).unwrap();

        let keys: Vec<_> = store
            .load_all("one")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![json!("a"), json!("c")]);
    }

    #[test]
    fn test_update_and_remove() {
        let store = MemoryStore::new();
        let id = store.create(&record("c", "a")).unwrap();

        let mut changed = record("c", "a");
        changed.priority = CachePriority::High;
        assert!(store.update(id, &changed).unwrap());
        assert_eq!(store.load(id).unwrap().unwrap().priority, CachePriority::High);

        store.remove(id).unwrap();
        store.remove(id).unwrap();
        assert!(store.is_empty());
        assert!(!store.update(id, &changed).unwrap());
    }
}
