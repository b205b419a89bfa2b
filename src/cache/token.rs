//! Expiration Token Module
//!
//! External change signals that can expire cache entries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Callback handed to [`ChangeToken::register_change_callback`].
pub type ChangeCallback = Box<dyn FnOnce() + Send + 'static>;

// == Token Registration ==
/// A live subscription to a token. Dropping it unsubscribes.
pub struct TokenRegistration {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TokenRegistration {
    /// Creates a registration that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A registration with nothing to release.
    pub fn empty() -> Self {
        Self { release: None }
    }
}

impl Drop for TokenRegistration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for TokenRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistration")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// == Change Token ==
/// An external signal that an entry's value is no longer valid.
///
/// Tokens are polled through [`has_changed`](ChangeToken::has_changed) when an
/// entry is checked for expiration. Tokens that report
/// [`active_change_callbacks`](ChangeToken::active_change_callbacks) are
/// additionally subscribed when the entry is committed. The callback may be
/// invoked from any thread, including while the token's owner holds its own
/// locks, so it must not block.
pub trait ChangeToken: Send + Sync {
    fn has_changed(&self) -> bool;

    fn active_change_callbacks(&self) -> bool {
        false
    }

    fn register_change_callback(&self, callback: ChangeCallback) -> TokenRegistration {
        drop(callback);
        TokenRegistration::empty()
    }
}

// == Cancellation Change Token ==
type CallbackMap = HashMap<u64, ChangeCallback>;

struct CancellationInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<CallbackMap>,
}

/// A token that changes once, when [`cancel`](CancellationChangeToken::cancel)
/// is called. Clones share state.
#[derive(Clone)]
pub struct CancellationChangeToken {
    inner: Arc<CancellationInner>,
}

impl CancellationChangeToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationInner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Signals the change and fires every registered callback once.
    ///
    /// Callbacks run on the calling thread after the registration lock is
    /// released.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<ChangeCallback> = {
            let mut map = self.inner.callbacks.lock();
            map.drain().map(|(_, callback)| callback).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Number of callbacks currently subscribed.
    pub fn registration_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

impl Default for CancellationChangeToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeToken for CancellationChangeToken {
    fn has_changed(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn active_change_callbacks(&self) -> bool {
        true
    }

    fn register_change_callback(&self, callback: ChangeCallback) -> TokenRegistration {
        if self.has_changed() {
            callback();
            return TokenRegistration::empty();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().insert(id, callback);

        // Lost a race with cancel(): the drain may have missed us.
        if self.has_changed() {
            let callback = self.inner.callbacks.lock().remove(&id);
            if let Some(callback) = callback {
                callback();
            }
            return TokenRegistration::empty();
        }

        let weak: Weak<CancellationInner> = Arc::downgrade(&self.inner);
        TokenRegistration::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.callbacks.lock().remove(&id);
                drop(removed);
            }
        })
    }
}

impl fmt::Debug for CancellationChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationChangeToken")
            .field("cancelled", &self.has_changed())
            .field("registrations", &self.registration_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_fires_callbacks_once() {
        let token = CancellationChangeToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let _registration = token.register_change_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!token.has_changed());
        token.cancel();
        token.cancel();

        assert!(token.has_changed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_registration_unsubscribes() {
        let token = CancellationChangeToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let registration = token.register_change_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(token.registration_count(), 1);

        drop(registration);
        assert_eq!(token.registration_count(), 0);

        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_after_cancel_fires_immediately() {
        let token = CancellationChangeToken::new();
        token.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _registration = token.register_change_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
