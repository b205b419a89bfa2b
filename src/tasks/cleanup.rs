//! Expiration Task
//!
//! Background task that periodically forces an expiration scan, so expired
//! entries leave the cache (and the durable store) even without traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheValue, PersistentCache};

/// Spawns a task that scans `cache` for expired entries every `interval`.
///
/// Each scan runs on the blocking pool since it may touch the durable store.
/// The task ends on its own once the cache is disposed; it can also be
/// stopped with [`JoinHandle::abort`].
///
/// # Example
/// ```ignore
/// let cache = Arc::new(PersistentCache::<String, String>::in_memory()?);
/// let handle = spawn_expiration_task(cache.clone(), Duration::from_secs(30));
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_expiration_task<K, V>(cache: Arc<PersistentCache<K, V>>, interval: Duration) -> JoinHandle<()>
where
    K: CacheKey,
    V: CacheValue,
{
    tokio::spawn(async move {
        info!(
            cache = %cache.cache_name(),
            "Starting expiration task with interval of {:?}",
            interval
        );

        loop {
            tokio::time::sleep(interval).await;

            let target = cache.clone();
            let outcome = tokio::task::spawn_blocking(move || target.scan_expired()).await;

            match outcome {
                Ok(Ok(removed)) if removed > 0 => {
                    info!("Expiration scan: removed {} expired entries", removed);
                }
                Ok(Ok(_)) => debug!("Expiration scan: no expired entries found"),
                Ok(Err(e)) => {
                    info!(error = %e, "Expiration task stopping");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Expiration scan did not complete");
                    break;
                }
            }
        }
    })
}
