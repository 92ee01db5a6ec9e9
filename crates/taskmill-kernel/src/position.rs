//! Cached queue-position lookup.
//!
//! Answers "where am I in the queue?" without walking the heap on every
//! request: the first lookup after a queue change walks the heap once in
//! array order, assigns 1-based positions, and memoizes the full map with a
//! monotonic timestamp.  Lookups within the TTL (default 200 ms) are served
//! from the cache.  The scheduler invalidates the cache on every enqueue,
//! dequeue, or removal; invalidation just drops the map.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::queue::TaskHeap;

/// Cached position lookup over the scheduler's heap.
pub struct PositionService {
    ttl: Duration,
    cache: Mutex<Option<PositionCache>>,
}

struct PositionCache {
    built_at: Instant,
    positions: HashMap<String, usize>,
    total: usize,
}

impl PositionService {
    /// Cache lifetime used by [`PositionService::default`].
    pub const DEFAULT_TTL: Duration = Duration::from_millis(200);

    /// Create a service with the given cache lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// `(position, total)` for `id`: the task's 1-based position in dequeue
    /// order of the heap array, or `None` with the current total when the
    /// id is not queued.
    ///
    /// The caller holds the scheduler lock for `heap`; this method only
    /// takes the short cache lock.
    pub fn get(&self, heap: &TaskHeap, id: &str) -> (Option<usize>, usize) {
        {
            let guard = self.lock();
            if let Some(cache) = guard.as_ref() {
                if cache.built_at.elapsed() < self.ttl {
                    return (cache.positions.get(id).copied(), cache.total);
                }
            }
        }
        self.rebuild(heap, id)
    }

    fn rebuild(&self, heap: &TaskHeap, id: &str) -> (Option<usize>, usize) {
        let total = heap.len();
        let positions: HashMap<String, usize> = heap
            .iter()
            .enumerate()
            .map(|(i, task)| (task.id().to_string(), i + 1))
            .collect();
        let answer = (positions.get(id).copied(), total);

        tracing::trace!(total, "queue position cache rebuilt");
        *self.lock() = Some(PositionCache {
            built_at: Instant::now(),
            positions,
            total,
        });
        answer
    }

    /// Drop the cache.  O(1); the next lookup rebuilds it.
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    /// Whether a lookup right now would be served from the cache.
    pub fn cache_valid(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|cache| cache.built_at.elapsed() < self.ttl)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PositionCache>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PositionService {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
