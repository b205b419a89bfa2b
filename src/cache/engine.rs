//! Cache Engine Module
//!
//! The live entry table, its locking discipline, and the commit, lookup,
//! removal, scan and compaction protocols. Durable-store calls that belong to
//! a table mutation happen under the write lock; eviction callbacks never do.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::clock::Clock;
use crate::cache::draft::EntryDraft;
use crate::cache::entry::{invoke_post_eviction_callbacks, CacheEntry, EntryParts, EvictionReason};
use crate::cache::policy::{self, CompactionCandidate};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::persistence::{DurableRecord, PersistentStore};
use crate::tasks::Worker;

// == Key and Value Capabilities ==
/// What a type needs to be used as a cache key.
///
/// Keys are persisted in their JSON form; a key serializing to `null` or to
/// an empty string is rejected.
pub trait CacheKey:
    Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Hash + Eq + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// What a type needs to be stored as a cache value.
///
/// Values are persisted in their JSON form and handed back typed on reload.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

// == Background Jobs ==
pub(crate) enum Job<K, V> {
    /// Remove every entry found expired.
    Scan,
    /// Compact because the size limit was exceeded.
    Compact,
    /// An attached token reported a change.
    TokenFired(Arc<CacheEntry<K, V>>),
    /// Write a persisted entry's access time back to the store.
    Flush(Arc<CacheEntry<K, V>>),
    /// Fire the callbacks of one removal batch.
    Evicted(Vec<Arc<CacheEntry<K, V>>>),
    /// Fire the callbacks of a draft that was never added.
    Abandoned(EntryParts<K, V>),
}

type Table<K, V> = HashMap<K, Arc<CacheEntry<K, V>>>;

// == Shared Engine State ==
pub(crate) struct Shared<K, V> {
    entries: RwLock<Table<K, V>>,
    options: CacheOptions,
    /// Present only when persistence is enabled
    store: Option<Arc<dyn PersistentStore>>,
    clock: Arc<dyn Clock>,
    disposed: AtomicBool,
    /// Unix milliseconds of the last background scan request
    last_expiration_scan: AtomicI64,
    compaction_pending: AtomicBool,
    stats: StatsRecorder,
    worker: Worker<Job<K, V>>,
    self_ref: Weak<Shared<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Shared<K, V> {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // == Commit ==
    /// Makes a draft the live entry for its key.
    pub(crate) fn commit(&self, mut parts: EntryParts<K, V>) -> Result<()> {
        if let Err(e) = self.check_disposed() {
            self.abandon(parts);
            return Err(e);
        }
        let Some(value) = parts.value.take() else {
            self.abandon(parts);
            return Err(CacheError::InvalidArgument(
                "a value must be set before the entry is committed".to_string(),
            ));
        };

        let now = self.clock.now();
        let absolute_expiration = policy::resolve_absolute_expiration(
            now,
            parts.absolute_expiration,
            parts.absolute_expiration_relative_to_now,
        );
        let entry = Arc::new(CacheEntry::from_parts(parts, value, absolute_expiration, now));

        let mut prior = None;
        let outcome = {
            let mut table = self.entries.write();
            let expired = entry.check_expired(now);
            let mirrored = if expired { Ok(()) } else { self.mirror(&entry) };

            mirrored.map(|()| {
                if let Some(previous) = table.remove(entry.key()) {
                    self.unmirror(&previous);
                    previous.set_expired(EvictionReason::Replaced);
                    prior = Some(previous);
                }

                if expired {
                    // Only a reloaded entry can already own a record here.
                    self.unmirror(&entry);
                    false
                } else {
                    table.insert(entry.key().clone(), entry.clone());
                    entry.attach_tokens(self.token_callback(&entry));
                    true
                }
            })
        };

        if let Some(previous) = prior {
            self.dispatch_evicted(vec![previous]);
        }

        let result = match outcome {
            Ok(true) => {
                self.check_memory_pressure();
                Ok(())
            }
            Ok(false) => {
                debug!(key = ?entry.key(), "entry already expired at commit; not added");
                self.dispatch_evicted(vec![entry]);
                Ok(())
            }
            Err(e) => {
                warn!(key = ?entry.key(), error = %e, "failed to mirror entry; commit rolled back");
                self.dispatch_evicted(vec![entry]);
                Err(e)
            }
        };

        self.start_scan_for_expired_items();
        result
    }

    /// Fires the callbacks of a draft that will never be added.
    pub(crate) fn abandon(&self, parts: EntryParts<K, V>) {
        if parts.callbacks.is_empty() {
            return;
        }
        self.submit(Job::Abandoned(parts));
    }

    fn token_callback(&self, entry: &Arc<CacheEntry<K, V>>) -> impl Fn() + Clone + Send + 'static {
        let cache = self.self_ref.clone();
        let entry = Arc::downgrade(entry);
        move || {
            let Some(entry) = entry.upgrade() else {
                return;
            };
            entry.note_token_fired();
            if let Some(cache) = cache.upgrade() {
                cache.submit(Job::TokenFired(entry));
            }
        }
    }

    // == Durable Mirror ==
    fn to_record(&self, entry: &CacheEntry<K, V>) -> Result<DurableRecord> {
        Ok(DurableRecord {
            id: entry.record_id(),
            cache_name: self.options.cache_name.clone(),
            key: serde_json::to_value(entry.key())?,
            priority: entry.priority(),
            value: serde_json::to_value(entry.value())?,
            last_accessed: entry.last_accessed(),
            absolute_expiration: entry.absolute_expiration(),
            sliding_expiration: entry.sliding_expiration(),
        })
    }

    /// Creates the entry's record unless it already has one (reload).
    fn mirror(&self, entry: &CacheEntry<K, V>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if entry.record_id().is_some() {
            return Ok(());
        }
        let record = self.to_record(entry)?;
        let id = store.create(&record)?;
        entry.assign_record_id(id);
        Ok(())
    }

    /// Deletes the entry's record and cancels any pending flush.
    fn unmirror(&self, entry: &CacheEntry<K, V>) {
        entry.take_dirty();
        let (Some(store), Some(id)) = (&self.store, entry.record_id()) else {
            return;
        };
        if let Err(e) = store.remove(id) {
            warn!(key = ?entry.key(), id, error = %e, "failed to delete durable record");
        }
    }

    fn flush(&self, entry: &CacheEntry<K, V>) {
        if !entry.take_dirty() {
            return;
        }
        let (Some(store), Some(id)) = (&self.store, entry.record_id()) else {
            return;
        };
        match self.to_record(entry).and_then(|record| store.update(id, &record)) {
            Ok(true) => {}
            Ok(false) => debug!(key = ?entry.key(), id, "record gone before flush"),
            Err(e) => warn!(key = ?entry.key(), id, error = %e, "failed to flush entry to store"),
        }
    }

    // == Lookup ==
    pub(crate) fn try_get<Q>(&self, key: &Q) -> Result<Option<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.check_disposed()?;
        let now = self.clock.now();

        let mut expired = None;
        let mut to_flush = None;
        let found = {
            let table = self.entries.read();
            match table.get(key) {
                Some(entry) if entry.check_expired(now) => {
                    expired = Some(entry.clone());
                    None
                }
                Some(entry) => {
                    entry.touch(now);
                    if self.store.is_some() && entry.mark_dirty() {
                        to_flush = Some(entry.clone());
                    }
                    Some(entry.value().clone())
                }
                None => None,
            }
        };

        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        if let Some(entry) = expired {
            self.remove_entries(vec![entry]);
        }
        if let Some(entry) = to_flush {
            self.submit(Job::Flush(entry));
        }

        self.start_scan_for_expired_items();
        Ok(found)
    }

    // == Removal ==
    pub(crate) fn remove<Q>(&self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.check_disposed()?;

        let entry = {
            let table = self.entries.read();
            table.get(key).map(|entry| {
                entry.set_expired(EvictionReason::Removed);
                entry.clone()
            })
        };
        if let Some(entry) = entry {
            self.remove_entries(vec![entry]);
        }

        self.start_scan_for_expired_items();
        Ok(())
    }

    /// The single removal path. Removes each entry that is still the live one
    /// for its key, then dispatches callbacks for those actually removed.
    fn remove_entries(&self, entries: Vec<Arc<CacheEntry<K, V>>>) -> usize {
        if entries.is_empty() {
            return 0;
        }

        let removed: Vec<_> = {
            let mut table = self.entries.write();
            entries
                .into_iter()
                .filter(|entry| {
                    let is_live = table
                        .get(entry.key())
                        .is_some_and(|current| Arc::ptr_eq(current, entry));
                    if is_live {
                        table.remove(entry.key());
                        self.unmirror(entry);
                    }
                    is_live
                })
                .collect()
        };

        let count = removed.len();
        self.dispatch_evicted(removed);
        count
    }

    fn dispatch_evicted(&self, entries: Vec<Arc<CacheEntry<K, V>>>) {
        for entry in &entries {
            self.stats.record_eviction(entry.eviction_reason());
        }
        let pending: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.has_pending_callbacks())
            .collect();
        if !pending.is_empty() {
            self.submit(Job::Evicted(pending));
        }
    }

    pub(crate) fn clear(&self) -> Result<usize> {
        self.check_disposed()?;
        let all: Vec<_> = {
            let table = self.entries.read();
            table
                .values()
                .map(|entry| {
                    entry.set_expired(EvictionReason::Removed);
                    entry.clone()
                })
                .collect()
        };
        Ok(self.remove_entries(all))
    }

    // == Expiration Scan ==
    /// Requests a background scan if the scan interval has elapsed.
    fn start_scan_for_expired_items(&self) {
        let now = self.clock.now().timestamp_millis();
        let last = self.last_expiration_scan.load(Ordering::Acquire);
        let frequency =
            i64::try_from(self.options.expiration_scan_frequency.as_millis()).unwrap_or(i64::MAX);

        if now.saturating_sub(last) > frequency
            && self
                .last_expiration_scan
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.submit(Job::Scan);
        }
    }

    pub(crate) fn scan_expired(&self) -> Result<usize> {
        self.check_disposed()?;
        self.last_expiration_scan
            .fetch_max(self.clock.now().timestamp_millis(), Ordering::AcqRel);
        Ok(self.scan_for_expired_items())
    }

    fn scan_for_expired_items(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<_> = {
            let table = self.entries.read();
            table
                .values()
                .filter(|entry| entry.check_expired(now))
                .cloned()
                .collect()
        };
        let removed = self.remove_entries(expired);
        if removed > 0 {
            debug!(cache = %self.options.cache_name, removed, "expiration scan removed entries");
        }
        removed
    }

    // == Compaction ==
    pub(crate) fn compact(&self, percentage: f64) -> Result<usize> {
        self.check_disposed()?;
        if !(0.0..=1.0).contains(&percentage) {
            return Err(CacheError::InvalidArgument(format!(
                "compaction percentage {percentage} is outside [0, 1]"
            )));
        }
        Ok(self.compact_to(|total| policy::removal_target(total, percentage)))
    }

    /// Removes expired entries plus enough low-priority, least recently used
    /// entries to reach `target_for(live entry count)`.
    fn compact_to(&self, target_for: impl FnOnce(usize) -> usize) -> usize {
        let now = self.clock.now();
        let doomed = {
            let table = self.entries.read();
            let target = target_for(table.len());

            let mut expired = Vec::new();
            let mut live = Vec::new();
            for entry in table.values() {
                if entry.check_expired(now) {
                    expired.push(entry.clone());
                } else {
                    live.push(entry.clone());
                }
            }

            let candidates: Vec<_> = live
                .iter()
                .map(|entry| CompactionCandidate {
                    priority: entry.priority(),
                    last_accessed: entry.last_accessed(),
                })
                .collect();
            for index in policy::select_for_compaction(&candidates, expired.len(), target) {
                let entry = &live[index];
                entry.set_expired(EvictionReason::Capacity);
                expired.push(entry.clone());
            }
            expired
        };

        let removed = self.remove_entries(doomed);
        debug!(cache = %self.options.cache_name, removed, "compaction finished");
        removed
    }

    fn check_memory_pressure(&self) {
        if !self.options.compact_on_memory_pressure {
            return;
        }
        let Some(limit) = self.options.size_limit else {
            return;
        };
        if self.entries.read().len() <= limit {
            return;
        }
        if !self.compaction_pending.swap(true, Ordering::AcqRel) {
            self.submit(Job::Compact);
        }
    }

    fn compact_for_pressure(&self) {
        let percentage = self.options.compaction_percentage;
        let limit = self.options.size_limit.unwrap_or(usize::MAX);
        let removed = self.compact_to(|total| {
            policy::removal_target(total, percentage).max(total.saturating_sub(limit))
        });
        info!(cache = %self.options.cache_name, removed, "compacted under memory pressure");
    }

    // == Background Work ==
    /// Queues a job. When the queue is full or closed, callback and flush
    /// work runs on the calling thread; scans and compactions are dropped.
    fn submit(&self, job: Job<K, V>) {
        let job = match self.worker.try_submit(job) {
            Ok(()) => return,
            Err(job) => job,
        };
        match job {
            Job::Evicted(_) | Job::Abandoned(_) | Job::Flush(_) => self.run_job(job),
            Job::Compact => {
                self.compaction_pending.store(false, Ordering::Release);
                debug!("work queue unavailable; compaction skipped");
            }
            Job::Scan => debug!("work queue unavailable; expiration scan skipped"),
            Job::TokenFired(entry) => {
                debug!(key = ?entry.key(), "work queue unavailable; token expiry left for next check")
            }
        }
    }

    fn run_job(&self, job: Job<K, V>) {
        match job {
            Job::Scan => {
                if !self.is_disposed() {
                    self.scan_for_expired_items();
                }
            }
            Job::Compact => {
                self.compaction_pending.store(false, Ordering::Release);
                if !self.is_disposed() {
                    self.compact_for_pressure();
                }
            }
            Job::TokenFired(entry) => {
                if !self.is_disposed() && entry.check_expired(self.clock.now()) {
                    self.remove_entries(vec![entry]);
                    self.start_scan_for_expired_items();
                }
            }
            Job::Flush(entry) => self.flush(&entry),
            Job::Evicted(entries) => {
                for entry in entries {
                    entry.invoke_eviction_callbacks();
                }
            }
            Job::Abandoned(parts) => invoke_post_eviction_callbacks(
                parts.callbacks,
                &parts.key,
                parts.value.as_ref(),
                EvictionReason::None,
            ),
        }
    }

    // == Reload ==
    fn reload_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut records = store.load_all(&self.options.cache_name)?;
        records.sort_by_key(|record| record.id);
        let total = records.len();

        let mut restored = 0;
        for record in records {
            let id = record.id;
            let parts: EntryParts<K, V> = match draft_from_record(record) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(id = ?id, error = %e, "skipping unreadable durable record");
                    continue;
                }
            };
            let key = parts.key.clone();
            self.commit(parts)?;
            if self.entries.read().contains_key(&key) {
                restored += 1;
            }
        }

        debug!(cache = %self.options.cache_name, restored, total, "reloaded entries from store");
        Ok(restored)
    }

    // == Teardown ==
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.shutdown();

        let live: Vec<_> = self.entries.read().values().cloned().collect();
        for entry in live {
            entry.detach_tokens();
        }
        info!(cache = %self.options.cache_name, "cache disposed");
    }
}

fn draft_from_record<K: CacheKey, V: CacheValue>(record: DurableRecord) -> Result<EntryParts<K, V>> {
    let Some(id) = record.id else {
        return Err(CacheError::Store("durable record has no identifier".to_string()));
    };

    let mut parts = EntryParts::new(serde_json::from_value(record.key)?);
    parts.value = Some(serde_json::from_value(record.value)?);
    parts.priority = record.priority;
    parts.absolute_expiration = record.absolute_expiration;
    if let Some(sliding) = record.sliding_expiration {
        parts.set_sliding_expiration(sliding)?;
    }
    parts.record_id = Some(id);
    Ok(parts)
}

fn validate_key<K: CacheKey>(key: &K) -> Result<()> {
    match serde_json::to_value(key)? {
        serde_json::Value::Null => Err(CacheError::InvalidArgument("key must not be null".to_string())),
        serde_json::Value::String(s) if s.is_empty() => {
            Err(CacheError::InvalidArgument("key must not be empty".to_string()))
        }
        _ => Ok(()),
    }
}

// == Persistent Cache ==
/// An in-process key/value cache whose entries are mirrored to a durable
/// store and reloaded when a new cache opens the same namespace.
///
/// Dropping the cache disposes it: queued callbacks are drained and the
/// background worker is joined. Records stay in the store.
pub struct PersistentCache<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
}

impl<K: CacheKey, V: CacheValue> PersistentCache<K, V> {
    /// Builds a cache, reloading the namespace from the store when persistent.
    pub fn new(options: CacheOptions) -> Result<Self> {
        options.validate()?;

        let (worker, receiver) = Worker::new(options.work_queue_capacity);
        let store = if options.is_persistent {
            options.store.clone()
        } else {
            None
        };
        let clock = options.clock.clone();
        let started = clock.now().timestamp_millis();

        let shared = Arc::new_cyclic(|self_ref| Shared {
            entries: RwLock::new(HashMap::new()),
            options,
            store,
            clock,
            disposed: AtomicBool::new(false),
            last_expiration_scan: AtomicI64::new(started),
            compaction_pending: AtomicBool::new(false),
            stats: StatsRecorder::default(),
            worker,
            self_ref: self_ref.clone(),
        });

        let handler_ref = Arc::downgrade(&shared);
        shared
            .worker
            .start("persistent-cache-worker", receiver, move |job| {
                if let Some(shared) = handler_ref.upgrade() {
                    shared.run_job(job);
                }
            })?;

        let cache = Self { shared };
        let restored = cache.shared.reload_from_store()?;
        info!(
            cache = %cache.shared.options.cache_name,
            persistent = cache.shared.store.is_some(),
            restored,
            "cache opened"
        );
        Ok(cache)
    }

    /// A non-persistent cache with default options.
    pub fn in_memory() -> Result<Self> {
        Self::new(CacheOptions::in_memory())
    }

    /// Starts a draft for `key`. Nothing is visible until the draft is committed.
    pub fn create_entry(&self, key: K) -> Result<EntryDraft<K, V>> {
        self.shared.check_disposed()?;
        validate_key(&key)?;
        Ok(EntryDraft::new(self.shared.self_ref.clone(), key))
    }

    /// Stores `value` under `key` with default entry options.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        let mut draft = self.create_entry(key)?;
        draft.set_value(value);
        draft.commit()
    }

    /// Stores `value` under `key` after letting `configure` adjust the draft.
    pub fn set_with<F>(&self, key: K, value: V, configure: F) -> Result<()>
    where
        F: FnOnce(&mut EntryDraft<K, V>) -> Result<()>,
    {
        let mut draft = self.create_entry(key)?;
        draft.set_value(value);
        configure(&mut draft)?;
        draft.commit()
    }

    /// Returns the value for `key` unless it is absent or expired.
    pub fn get<Q>(&self, key: &Q) -> Result<Option<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.try_get(key)
    }

    /// Whether `key` holds an unexpired entry. Does not count as an access.
    pub fn contains_key<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.check_disposed()?;
        let now = self.shared.clock.now();
        let table = self.shared.entries.read();
        Ok(table.get(key).is_some_and(|entry| !entry.check_expired(now)))
    }

    /// Removes `key`. Removing an absent key does nothing.
    pub fn remove<Q>(&self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.remove(key)
    }

    /// Removes at least `percentage` (0.0 to 1.0) of the entries, expired
    /// ones first, then by priority and least recent use. Returns how many
    /// entries were removed.
    pub fn compact(&self, percentage: f64) -> Result<usize> {
        self.shared.compact(percentage)
    }

    /// Runs an expiration scan now, ignoring the scan interval.
    pub fn scan_expired(&self) -> Result<usize> {
        self.shared.scan_expired()
    }

    /// Removes every entry.
    pub fn clear(&self) -> Result<usize> {
        self.shared.clear()
    }

    /// Snapshot of the keys currently in the table, expired or not.
    pub fn keys(&self) -> Result<Vec<K>> {
        self.shared.check_disposed()?;
        Ok(self.shared.entries.read().keys().cloned().collect())
    }

    /// Number of entries in the table, for diagnostics.
    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(self.len())
    }

    pub fn cache_name(&self) -> &str {
        &self.shared.options.cache_name
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.store.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Tears the cache down. Further operations fail with
    /// [`CacheError::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl<K: CacheKey, V: CacheValue> Drop for PersistentCache<K, V> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for PersistentCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCache")
            .field("cache_name", &self.shared.options.cache_name)
            .field("entries", &self.len())
            .field("persistent", &self.is_persistent())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
