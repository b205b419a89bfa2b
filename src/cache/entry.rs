//! Cache Entry Module
//!
//! Defines cache entries, their draft form, and the expiration state machine.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::policy;
use crate::cache::token::{ChangeToken, TokenRegistration};
use crate::error::{CacheError, Result};
use crate::persistence::RecordId;

// == Cache Priority ==
/// How reluctant compaction is to remove an entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    /// Never removed by compaction; still subject to expiration and removal.
    NeverRemove,
}

impl CachePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePriority::Low => "low",
            CachePriority::Normal => "normal",
            CachePriority::High => "high",
            CachePriority::NeverRemove => "never_remove",
        }
    }
}

impl FromStr for CachePriority {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(CachePriority::Low),
            "normal" => Ok(CachePriority::Normal),
            "high" => Ok(CachePriority::High),
            "never_remove" | "neverremove" => Ok(CachePriority::NeverRemove),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown cache priority: {other}"
            ))),
        }
    }
}

impl fmt::Display for CachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Eviction Reason ==
/// Why an entry left the cache. Recorded once per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EvictionReason {
    /// Not evicted, or a draft that was never added.
    #[default]
    None,
    /// Removed explicitly by the caller.
    Removed,
    /// Superseded by a newer entry under the same key.
    Replaced,
    /// Absolute or sliding expiration elapsed.
    Expired,
    /// An attached expiration token reported a change.
    TokenExpired,
    /// Picked by compaction.
    Capacity,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EvictionReason::None => "none",
            EvictionReason::Removed => "removed",
            EvictionReason::Replaced => "replaced",
            EvictionReason::Expired => "expired",
            EvictionReason::TokenExpired => "token expired",
            EvictionReason::Capacity => "capacity",
        };
        f.write_str(text)
    }
}

/// Called after an entry has been evicted, with its key, last value and reason.
///
/// The value is `None` only for drafts dropped before a value was set.
pub type PostEvictionCallback<K, V> =
    Box<dyn Fn(&K, Option<&V>, EvictionReason) + Send + Sync + 'static>;

// == Entry Parts ==
/// Everything a caller configures on a draft before it is committed.
pub(crate) struct EntryParts<K, V> {
    pub(crate) key: K,
    pub(crate) value: Option<V>,
    pub(crate) priority: CachePriority,
    pub(crate) absolute_expiration: Option<DateTime<Utc>>,
    pub(crate) absolute_expiration_relative_to_now: Option<Duration>,
    pub(crate) sliding_expiration: Option<Duration>,
    pub(crate) tokens: Vec<Arc<dyn ChangeToken>>,
    pub(crate) callbacks: Vec<PostEvictionCallback<K, V>>,
    pub(crate) record_id: Option<RecordId>,
}

impl<K, V> EntryParts<K, V> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            value: None,
            priority: CachePriority::Normal,
            absolute_expiration: None,
            absolute_expiration_relative_to_now: None,
            sliding_expiration: None,
            tokens: Vec::new(),
            callbacks: Vec::new(),
            record_id: None,
        }
    }

    pub(crate) fn set_absolute_expiration_relative_to_now(&mut self, duration: Duration) -> Result<()> {
        self.absolute_expiration_relative_to_now = Some(positive(duration, "relative expiration")?);
        Ok(())
    }

    pub(crate) fn set_sliding_expiration(&mut self, duration: Duration) -> Result<()> {
        self.sliding_expiration = Some(positive(duration, "sliding expiration")?);
        Ok(())
    }
}

fn positive(duration: Duration, what: &str) -> Result<Duration> {
    if duration.is_zero() {
        return Err(CacheError::InvalidArgument(format!(
            "the {what} value must be positive"
        )));
    }
    Ok(duration)
}

// == Cache Entry ==
struct EntryState<K, V> {
    last_accessed: DateTime<Utc>,
    is_expired: bool,
    eviction_reason: EvictionReason,
    registrations: Vec<TokenRegistration>,
    callbacks: Option<Vec<PostEvictionCallback<K, V>>>,
}

/// A committed entry. Shared between the table and background work.
///
/// Configuration is fixed at commit; only access time and the expiration
/// state change afterwards. The state mutex is a leaf lock: nothing is
/// called out to while it is held.
pub struct CacheEntry<K, V> {
    key: K,
    value: V,
    priority: CachePriority,
    absolute_expiration: Option<DateTime<Utc>>,
    sliding_expiration: Option<Duration>,
    tokens: Vec<Arc<dyn ChangeToken>>,
    record_id: OnceLock<RecordId>,
    token_fired: AtomicBool,
    dirty: AtomicBool,
    state: Mutex<EntryState<K, V>>,
}

impl<K, V> CacheEntry<K, V> {
    /// Builds an entry from a draft whose value is set and whose absolute
    /// expiration has already been resolved against `now`.
    pub(crate) fn from_parts(
        parts: EntryParts<K, V>,
        value: V,
        absolute_expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let record_id = OnceLock::new();
        if let Some(id) = parts.record_id {
            let _ = record_id.set(id);
        }
        let callbacks = if parts.callbacks.is_empty() {
            None
        } else {
            Some(parts.callbacks)
        };

        Self {
            key: parts.key,
            value,
            priority: parts.priority,
            absolute_expiration,
            sliding_expiration: parts.sliding_expiration,
            tokens: parts.tokens,
            record_id,
            token_fired: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            state: Mutex::new(EntryState {
                last_accessed: now,
                is_expired: false,
                eviction_reason: EvictionReason::None,
                registrations: Vec::new(),
                callbacks,
            }),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn priority(&self) -> CachePriority {
        self.priority
    }

    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.absolute_expiration
    }

    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.sliding_expiration
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.state.lock().last_accessed
    }

    pub fn eviction_reason(&self) -> EvictionReason {
        self.state.lock().eviction_reason
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id.get().copied()
    }

    /// Records the durable identifier. Later assignments are ignored.
    pub(crate) fn assign_record_id(&self, id: RecordId) {
        let _ = self.record_id.set(id);
    }

    // == Access Tracking ==
    /// Stamps the last access time.
    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        self.state.lock().last_accessed = now;
    }

    /// Marks the durable mirror stale. Returns true if it was clean before.
    pub(crate) fn mark_dirty(&self) -> bool {
        !self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Clears the stale flag. Returns true if a flush was owed.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    // == Expiration ==
    /// Evaluates expiration lazily at `now`, marking the entry on the way.
    pub(crate) fn check_expired(&self, now: DateTime<Utc>) -> bool {
        let last_accessed = {
            let state = self.state.lock();
            if state.is_expired {
                return true;
            }
            state.last_accessed
        };

        let reason = policy::time_expiration(
            now,
            self.absolute_expiration,
            self.sliding_expiration,
            last_accessed,
        )
        .or_else(|| self.tokens_changed().then_some(EvictionReason::TokenExpired));

        match reason {
            Some(reason) => {
                self.set_expired(reason);
                true
            }
            None => false,
        }
    }

    fn tokens_changed(&self) -> bool {
        self.token_fired.load(Ordering::Acquire) || self.tokens.iter().any(|token| token.has_changed())
    }

    /// Marks the entry expired. The first non-`None` reason sticks.
    /// Token subscriptions are released once the state lock is dropped.
    pub(crate) fn set_expired(&self, reason: EvictionReason) {
        let registrations = {
            let mut state = self.state.lock();
            state.is_expired = true;
            if state.eviction_reason == EvictionReason::None {
                state.eviction_reason = reason;
            }
            std::mem::take(&mut state.registrations)
        };
        drop(registrations);
    }

    /// Releases token subscriptions without expiring the entry.
    pub(crate) fn detach_tokens(&self) {
        let registrations = std::mem::take(&mut self.state.lock().registrations);
        drop(registrations);
    }

    /// Remembers that a token fired even if the notification can't be queued.
    pub(crate) fn note_token_fired(&self) {
        self.token_fired.store(true, Ordering::Release);
    }

    // == Token Attachment ==
    /// Subscribes `on_change` to every token that supports active callbacks.
    pub(crate) fn attach_tokens<F>(&self, on_change: F)
    where
        F: Fn() + Clone + Send + 'static,
    {
        let registrations: Vec<TokenRegistration> = self
            .tokens
            .iter()
            .filter(|token| token.active_change_callbacks())
            .map(|token| token.register_change_callback(Box::new(on_change.clone())))
            .collect();
        if registrations.is_empty() {
            return;
        }

        let stale = {
            let mut state = self.state.lock();
            if state.is_expired {
                registrations
            } else {
                state.registrations.extend(registrations);
                Vec::new()
            }
        };
        drop(stale);
    }

    // == Eviction Callbacks ==
    /// Runs the post-eviction callbacks once. Later calls do nothing.
    pub(crate) fn invoke_eviction_callbacks(&self)
    where
        K: fmt::Debug,
    {
        let (callbacks, reason) = {
            let mut state = self.state.lock();
            (state.callbacks.take(), state.eviction_reason)
        };
        if let Some(callbacks) = callbacks {
            invoke_post_eviction_callbacks(callbacks, &self.key, Some(&self.value), reason);
        }
    }

    pub(crate) fn has_pending_callbacks(&self) -> bool {
        self.state.lock().callbacks.is_some()
    }
}

impl<K: fmt::Debug, V> fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("absolute_expiration", &self.absolute_expiration)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("last_accessed", &state.last_accessed)
            .field("eviction_reason", &state.eviction_reason)
            .field("record_id", &self.record_id.get())
            .finish()
    }
}

/// Invokes callbacks in order. A panicking callback is logged and skipped.
pub(crate) fn invoke_post_eviction_callbacks<K: fmt::Debug, V>(
    callbacks: Vec<PostEvictionCallback<K, V>>,
    key: &K,
    value: Option<&V>,
    reason: EvictionReason,
) {
    for callback in callbacks {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(key, value, reason)));
        if outcome.is_err() {
            warn!(?key, %reason, "post-eviction callback panicked; ignoring");
        }
    }
}
