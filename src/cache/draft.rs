//! Entry Draft Module
//!
//! A draft is an entry under construction by its creator. It becomes visible
//! only when committed; dropping it uncommitted fires its eviction callbacks
//! as "never added".

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::engine::{CacheKey, CacheValue, Shared};
use crate::cache::entry::{
    invoke_post_eviction_callbacks, CachePriority, EntryParts, EvictionReason,
};
use crate::cache::token::ChangeToken;
use crate::error::{CacheError, Result};

/// A pending cache entry bound to the cache that created it.
pub struct EntryDraft<K: CacheKey, V: CacheValue> {
    cache: Weak<Shared<K, V>>,
    parts: EntryParts<K, V>,
}

impl<K: CacheKey, V: CacheValue> EntryDraft<K, V> {
    pub(crate) fn new(cache: Weak<Shared<K, V>>, key: K) -> Self {
        Self {
            cache,
            parts: EntryParts::new(key),
        }
    }

    /// Moves the configuration out, leaving a draft with nothing left to fire.
    fn take_parts(&mut self) -> EntryParts<K, V> {
        let parts = &mut self.parts;
        EntryParts {
            key: parts.key.clone(),
            value: parts.value.take(),
            priority: parts.priority,
            absolute_expiration: parts.absolute_expiration,
            absolute_expiration_relative_to_now: parts.absolute_expiration_relative_to_now,
            sliding_expiration: parts.sliding_expiration,
            tokens: mem::take(&mut parts.tokens),
            callbacks: mem::take(&mut parts.callbacks),
            record_id: parts.record_id,
        }
    }

    pub fn key(&self) -> &K {
        &self.parts.key
    }

    pub fn value(&self) -> Option<&V> {
        self.parts.value.as_ref()
    }

    pub fn priority(&self) -> CachePriority {
        self.parts.priority
    }

    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.parts.absolute_expiration
    }

    pub fn absolute_expiration_relative_to_now(&self) -> Option<Duration> {
        self.parts.absolute_expiration_relative_to_now
    }

    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.parts.sliding_expiration
    }

    pub fn set_value(&mut self, value: V) -> &mut Self {
        self.parts.value = Some(value);
        self
    }

    pub fn set_priority(&mut self, priority: CachePriority) -> &mut Self {
        self.parts.priority = priority;
        self
    }

    /// Expires the entry at a fixed instant.
    pub fn set_absolute_expiration(&mut self, instant: DateTime<Utc>) -> &mut Self {
        self.parts.absolute_expiration = Some(instant);
        self
    }

    /// Expires the entry `duration` after it is committed. Must be positive.
    pub fn set_absolute_expiration_relative_to_now(&mut self, duration: Duration) -> Result<&mut Self> {
        self.parts.set_absolute_expiration_relative_to_now(duration)?;
        Ok(self)
    }

    /// Expires the entry once it has not been read for `duration`. Must be
    /// positive. Does not extend an absolute expiration.
    pub fn set_sliding_expiration(&mut self, duration: Duration) -> Result<&mut Self> {
        self.parts.set_sliding_expiration(duration)?;
        Ok(self)
    }

    /// Expires the entry when `token` reports a change.
    pub fn add_expiration_token(&mut self, token: Arc<dyn ChangeToken>) -> &mut Self {
        self.parts.tokens.push(token);
        self
    }

    /// Registers a callback fired on a background thread after eviction.
    pub fn register_post_eviction_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&K, Option<&V>, EvictionReason) + Send + Sync + 'static,
    {
        self.parts.callbacks.push(Box::new(callback));
        self
    }

    /// Makes this draft the live entry for its key, superseding any previous one.
    ///
    /// An entry that is already expired is not added; its callbacks fire
    /// instead and the commit still succeeds.
    pub fn commit(mut self) -> Result<()> {
        let parts = self.take_parts();
        match self.cache.upgrade() {
            Some(cache) => cache.commit(parts),
            None => {
                run_orphaned(parts);
                Err(CacheError::Disposed)
            }
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for EntryDraft<K, V> {
    fn drop(&mut self) {
        // Committed drafts, and drafts without callbacks, have nothing to report.
        if self.parts.callbacks.is_empty() {
            return;
        }
        let parts = self.take_parts();
        match self.cache.upgrade() {
            Some(cache) => cache.abandon(parts),
            None => run_orphaned(parts),
        }
    }
}

/// Callbacks of a draft whose cache no longer exists run on the spot.
fn run_orphaned<K: CacheKey, V: CacheValue>(parts: EntryParts<K, V>) {
    invoke_post_eviction_callbacks(
        parts.callbacks,
        &parts.key,
        parts.value.as_ref(),
        EvictionReason::None,
    );
}

impl<K: CacheKey, V: CacheValue + fmt::Debug> fmt::Debug for EntryDraft<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = &self.parts;
        f.debug_struct("EntryDraft")
            .field("key", &parts.key)
            .field("value", &parts.value)
            .field("priority", &parts.priority)
            .field("absolute_expiration", &parts.absolute_expiration)
            .field(
                "absolute_expiration_relative_to_now",
                &parts.absolute_expiration_relative_to_now,
            )
            .field("sliding_expiration", &parts.sliding_expiration)
            .finish()
    }
}
