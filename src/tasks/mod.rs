//! Background Tasks Module
//!
//! Contains the work that runs off the caller's thread.
//!
//! # Tasks
//! - Worker: drains the cache's job queue (callbacks, scans, flushes, compaction)
//! - Expiration: optionally forces expiration scans at a fixed interval

mod cleanup;
mod worker;

pub use cleanup::spawn_expiration_task;
pub(crate) use worker::Worker;
