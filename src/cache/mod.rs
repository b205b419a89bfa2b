//! Cache Module
//!
//! Provides the in-memory cache engine with absolute, sliding and
//! token-driven expiration, priority/LRU compaction, and durable mirroring.

mod clock;
mod draft;
mod engine;
mod entry;
pub mod policy;
mod stats;
mod token;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use clock::{Clock, ManualClock, SystemClock};
pub use draft::EntryDraft;
pub use engine::{CacheKey, CacheValue, PersistentCache};
pub use entry::{CachePriority, EvictionReason, PostEvictionCallback};
pub use stats::{CacheStats, EvictionStats};
pub use token::{CancellationChangeToken, ChangeCallback, ChangeToken, TokenRegistration};
