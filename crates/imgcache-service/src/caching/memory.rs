//! The in-memory tier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use crate::codec::Image;
use crate::utils::clock::Clock;

use super::{CacheEntry, CacheKey};

const RECENCY_WEIGHT: f64 = 0.7;
const FREQUENCY_WEIGHT: f64 = 0.3;

/// Access statistics of a resident entry.
#[derive(Debug, Clone, Copy)]
struct AccessStats {
    last_accessed_at: DateTime<Utc>,
    access_count: u64,
}

impl AccessStats {
    /// Higher is more valuable: recently and frequently used entries survive a reclaim.
    fn score(&self, now: DateTime<Utc>) -> f64 {
        let idle = (now - self.last_accessed_at).num_milliseconds() as f64 / 1000.0;
        RECENCY_WEIGHT * -idle + FREQUENCY_WEIGHT * self.access_count as f64
    }
}

type ScoreTable = Arc<Mutex<HashMap<CacheKey, AccessStats>>>;

/// A bounded, cost-weighted map of decoded images.
///
/// The budget is the decoded footprint of all resident images. Eviction under budget pressure is
/// done by the underlying [`moka`] cache, while [`reclaim`](Self::reclaim) drops the
/// lowest-scoring half of all entries on demand.
pub struct MemoryCache {
    cache: Cache<CacheKey, CacheEntry>,
    scores: ScoreTable,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryCache {
    /// Creates a memory tier holding at most `capacity` bytes of decoded pixels.
    pub fn new(capacity: u64, clock: Arc<dyn Clock>) -> Self {
        let scores = ScoreTable::default();

        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|_key, entry: &CacheEntry| -> u32 {
                entry.byte_size.try_into().unwrap_or(u32::MAX)
            })
            .eviction_listener({
                let scores = Arc::clone(&scores);
                move |key: Arc<CacheKey>, _entry, cause| {
                    // Explicit removals clean up after themselves.
                    if cause == RemovalCause::Size || cause == RemovalCause::Expired {
                        lock(&scores).remove(&*key);
                        metric!(counter("caches.memory.evicted") += 1);
                    }
                }
            })
            .build();

        Self {
            cache,
            scores,
            clock,
        }
    }

    /// Inserts `entry`, replacing any previous entry for the same key.
    pub fn store(&self, mut entry: CacheEntry) {
        entry.byte_size = entry.image.decoded_size();
        let key = entry.key.clone();
        let stats = AccessStats {
            last_accessed_at: self.clock.now().max(entry.created_at),
            access_count: entry.access_count,
        };

        // Never call into the map while holding the score table, the eviction listener locks it.
        self.cache.insert(key.clone(), entry);
        lock(&self.scores).insert(key, stats);
    }

    pub fn retrieve(&self, key: &CacheKey) -> Option<Image> {
        self.retrieve_entry(key).map(|entry| entry.image)
    }

    /// Looks up `key` and records the access.
    pub fn retrieve_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut entry = self.cache.get(key)?;
        let now = self.clock.now();

        let stats = {
            let mut scores = lock(&self.scores);
            let stats = scores.entry(key.clone()).or_insert(AccessStats {
                last_accessed_at: entry.last_accessed_at,
                access_count: entry.access_count,
            });
            stats.last_accessed_at = now.max(entry.created_at);
            stats.access_count += 1;
            *stats
        };

        entry.last_accessed_at = stats.last_accessed_at;
        entry.access_count = stats.access_count;
        Some(entry)
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
        lock(&self.scores).remove(key);
    }

    pub fn remove_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        lock(&self.scores).clear();
    }

    /// Replaces the validator of a resident entry, without counting as an access.
    ///
    /// Returns `false` if `key` is not resident.
    pub fn update_etag(&self, key: &CacheKey, etag: Option<String>) -> bool {
        let Some(mut entry) = self.cache.get(key) else {
            return false;
        };
        entry.etag = etag;
        self.cache.insert(key.clone(), entry);
        true
    }

    /// Drops the lowest-scoring half of the resident entries, but at least one.
    ///
    /// Scores are computed at the time of the call. Returns the number of removed entries.
    pub fn reclaim(&self) -> usize {
        self.cache.run_pending_tasks();
        let now = self.clock.now();

        let mut ranked: Vec<(CacheKey, f64)> = {
            let scores = lock(&self.scores);
            self.cache
                .iter()
                .map(|(key, entry)| {
                    let stats = scores.get(&*key).copied().unwrap_or(AccessStats {
                        last_accessed_at: entry.last_accessed_at,
                        access_count: entry.access_count,
                    });
                    (CacheKey::clone(&key), stats.score(now))
                })
                .collect()
        };
        if ranked.is_empty() {
            return 0;
        }

        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let victims = (ranked.len() / 2).max(1);
        ranked.truncate(victims);

        for (key, _) in &ranked {
            self.cache.invalidate(key);
        }
        {
            let mut scores = lock(&self.scores);
            for (key, _) in &ranked {
                scores.remove(key);
            }
        }

        tracing::debug!(removed = victims, "Reclaimed memory cache");
        metric!(counter("caches.memory.reclaimed") += victims as i64);
        victims
    }

    /// The number of resident entries, after pending evictions were applied.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// The accounted size of all resident entries, after pending evictions were applied.
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
