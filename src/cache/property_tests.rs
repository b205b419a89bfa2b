//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the cache against a plain map model.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CachePriority, ManualClock, PersistentCache};
use crate::config::CacheOptions;

// == Test Configuration ==
const NO_BACKGROUND_SCAN: Duration = Duration::from_secs(24 * 3600);

fn test_cache() -> PersistentCache<String, String> {
    let options = CacheOptions::in_memory()
        .with_clock(Arc::new(ManualClock::default()))
        .with_expiration_scan_frequency(NO_BACKGROUND_SCAN);
    PersistentCache::new(options).unwrap()
}

// == Strategies ==
/// Generates valid cache keys from a small alphabet so operations collide
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{0,32}"
}

fn priority_strategy() -> impl Strategy<Value = CachePriority> {
    prop_oneof![
        Just(CachePriority::Low),
        Just(CachePriority::Normal),
        Just(CachePriority::High),
        Just(CachePriority::NeverRemove),
    ]
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: String, value: String },
    Get { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (key_strategy(), value_strategy()).prop_map(|(key, value)| CacheOp::Set { key, value }),
        key_strategy().prop_map(|key| CacheOp::Get { key }),
        key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // The cache behaves like a map for any sequence of set/get/remove, and
    // the statistics count exactly the hits, misses, removals and replacements.
    #[test]
    fn prop_matches_map_model(ops in prop::collection::vec(cache_op_strategy(), 1..60)) {
        let cache = test_cache();
        let mut model: HashMap<String, String> = HashMap::new();
        let (mut hits, mut misses, mut removed, mut replaced) = (0u64, 0u64, 0u64, 0u64);

        for op in ops {
            match op {
                CacheOp::Set { key, value } => {
                    if model.insert(key.clone(), value.clone()).is_some() {
                        replaced += 1;
                    }
                    cache.set(key, value).unwrap();
                }
                CacheOp::Get { key } => {
                    let got = cache.get(key.as_str()).unwrap();
                    prop_assert_eq!(got.as_ref(), model.get(&key));
                    if got.is_some() { hits += 1 } else { misses += 1 }
                }
                CacheOp::Remove { key } => {
                    if model.remove(&key).is_some() {
                        removed += 1;
                    }
                    cache.remove(key.as_str()).unwrap();
                }
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits, hits);
        prop_assert_eq!(stats.misses, misses);
        prop_assert_eq!(stats.evictions.removed, removed);
        prop_assert_eq!(stats.evictions.replaced, replaced);
        prop_assert_eq!(stats.total_entries, model.len());
    }

    // Removing a key twice leaves the cache as the first removal did.
    #[test]
    fn prop_remove_is_idempotent(key in key_strategy(), value in value_strategy()) {
        let cache = test_cache();
        cache.set(key.clone(), value).unwrap();

        cache.remove(key.as_str()).unwrap();
        cache.remove(key.as_str()).unwrap();

        prop_assert_eq!(cache.get(key.as_str()).unwrap(), None);
        prop_assert_eq!(cache.stats().evictions.removed, 1);
    }

    // Compaction removes exactly its target (as far as removable entries
    // allow) and never touches NeverRemove entries.
    #[test]
    fn prop_compaction_respects_never_remove(
        priorities in prop::collection::vec(priority_strategy(), 1..40),
        percentage in 0.0f64..=1.0,
    ) {
        let cache = test_cache();
        for (i, priority) in priorities.iter().enumerate() {
            let priority = *priority;
            cache
                .set_with(format!("key{i}"), format!("value{i}"), |draft| {
                    draft.set_priority(priority);
                    Ok(())
                })
                .unwrap();
        }

        let total = priorities.len();
        let removable = priorities.iter().filter(|p| **p != CachePriority::NeverRemove).count();
        let target = (total as f64 * percentage).floor() as usize;

        let removed = cache.compact(percentage).unwrap();
        prop_assert_eq!(removed, target.min(removable));
        prop_assert_eq!(cache.len(), total - removed);

        for (i, priority) in priorities.iter().enumerate() {
            if *priority == CachePriority::NeverRemove {
                let key = format!("key{i}");
                prop_assert!(cache.get(key.as_str()).unwrap().is_some());
            }
        }
    }

    // A value survives reopening the cache over the same store.
    #[test]
    fn prop_values_survive_reopen(
        entries in prop::collection::hash_map(key_strategy(), value_strategy(), 1..10),
    ) {
        let store = Arc::new(crate::persistence::MemoryStore::new());
        {
            let cache: PersistentCache<String, String> =
                PersistentCache::new(CacheOptions::new("prop", store.clone())).unwrap();
            for (key, value) in &entries {
                cache.set(key.clone(), value.clone()).unwrap();
            }
        }

        let cache: PersistentCache<String, String> =
            PersistentCache::new(CacheOptions::new("prop", store)).unwrap();
        prop_assert_eq!(cache.len(), entries.len());
        for (key, value) in &entries {
            let got = cache.get(key.as_str()).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
    }
}
