//! Expiration and Compaction Policy
//!
//! Pure decision functions: no locks, no clocks, no store.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::clock::to_time_delta;
use crate::cache::entry::{CachePriority, EvictionReason};

// == Expiration ==
/// Decides whether an entry's time-based expiration has elapsed at `now`.
///
/// Absolute expiration wins over sliding expiration. An instant equal to the
/// deadline counts as expired. A last-access stamp in the future (clock moved
/// backwards) never expires the entry by sliding.
pub fn time_expiration(
    now: DateTime<Utc>,
    absolute_expiration: Option<DateTime<Utc>>,
    sliding_expiration: Option<Duration>,
    last_accessed: DateTime<Utc>,
) -> Option<EvictionReason> {
    if absolute_expiration.is_some_and(|deadline| now >= deadline) {
        return Some(EvictionReason::Expired);
    }

    if let Some(sliding) = sliding_expiration {
        let idle = now.signed_duration_since(last_accessed);
        if idle >= chrono::Duration::zero() && idle >= to_time_delta(sliding) {
            return Some(EvictionReason::Expired);
        }
    }

    None
}

/// Resolves the absolute expiration of an entry at commit time.
///
/// The relative duration is anchored at `now`; when both forms are present
/// the earlier deadline applies. A relative duration too large to represent
/// leaves only the explicit deadline.
pub fn resolve_absolute_expiration(
    now: DateTime<Utc>,
    absolute_expiration: Option<DateTime<Utc>>,
    relative_to_now: Option<Duration>,
) -> Option<DateTime<Utc>> {
    let relative = relative_to_now.and_then(|rel| now.checked_add_signed(to_time_delta(rel)));
    match (absolute_expiration, relative) {
        (Some(explicit), Some(relative)) => Some(explicit.min(relative)),
        (explicit, relative) => explicit.or(relative),
    }
}

// == Compaction ==
/// The facts compaction needs about one live, non-expired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionCandidate {
    pub priority: CachePriority,
    pub last_accessed: DateTime<Utc>,
}

/// Number of entries a compaction of `fraction` must remove out of `total`.
pub fn removal_target(total: usize, fraction: f64) -> usize {
    (total as f64 * fraction).floor() as usize
}

/// Picks which candidates to evict so that, together with the
/// `already_expired` entries, at least `target` entries go.
///
/// Buckets are drained Low, then Normal, then High. A bucket that cannot
/// overshoot the target is taken whole; otherwise its least recently used
/// entries are taken until the target is met. `NeverRemove` is never picked.
/// Returns indices into `candidates`.
pub fn select_for_compaction(
    candidates: &[CompactionCandidate],
    already_expired: usize,
    target: usize,
) -> Vec<usize> {
    let mut selected = Vec::new();
    let mut collected = already_expired;

    for priority in [CachePriority::Low, CachePriority::Normal, CachePriority::High] {
        if collected >= target {
            break;
        }

        let mut bucket: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.priority == priority)
            .map(|(index, _)| index)
            .collect();

        if collected + bucket.len() <= target {
            collected += bucket.len();
            selected.append(&mut bucket);
            continue;
        }

        bucket.sort_by_key(|&index| candidates[index].last_accessed);
        for index in bucket {
            selected.push(index);
            collected += 1;
            if collected >= target {
                break;
            }
        }
    }

    selected
}
