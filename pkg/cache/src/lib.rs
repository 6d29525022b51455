//! Per-batch memoization of aggregate results.
//!
//! Entries live until their TTL runs out or until the batch they were
//! computed from is invalidated. Each invalidation bumps a per-batch
//! generation; a computation that began under an older generation returns
//! its result to the caller but does not store it.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use schema::BatchId;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<(BatchId, K), CacheEntry<V>>,
    generations: HashMap<BatchId, u64>,
}

impl<K, V> Default for CacheState<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generations: HashMap::new(),
        }
    }
}

impl<K, V> CacheState<K, V> {
    fn generation(&self, batch_id: BatchId) -> u64 {
        self.generations.get(&batch_id).copied().unwrap_or(0)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[derive(Debug, Default)]
struct CacheMetricAtoms {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_discards: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Results computed across an invalidation and therefore not stored.
    pub stale_discards: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
pub struct ResultCache<K, V> {
    ttl: Duration,
    state: RwLock<CacheState<K, V>>,
    metrics: CacheMetricAtoms,
}

impl<K, V> ResultCache<K, V>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
            metrics: CacheMetricAtoms::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `(batch_id, kind)` if it is still live,
    /// otherwise runs `compute` without holding any cache lock. Errors from
    /// `compute` are passed through and never cached.
    pub fn get_or_compute<E>(
        &self,
        batch_id: BatchId,
        kind: K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let now = Instant::now();
        let generation = match self.state.read() {
            Ok(state) => {
                if let Some(entry) = state.entries.get(&(batch_id, kind))
                    && entry.expires_at > now
                {
                    self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(batch_id, ?kind, "aggregate cache hit");
                    return Ok(entry.value.clone());
                }
                Some(state.generation(batch_id))
            }
            Err(_) => None,
        };

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(batch_id, ?kind, "aggregate cache miss");
        let value = compute()?;

        let Some(generation) = generation else {
            tracing::warn!(batch_id, "aggregate cache lock poisoned; serving uncached");
            return Ok(value);
        };
        if let Ok(mut state) = self.state.write() {
            if state.generation(batch_id) == generation {
                let now = Instant::now();
                let purged = state.purge_expired(now);
                if purged > 0 {
                    tracing::debug!(purged, "expired aggregate cache entries dropped");
                }
                state.entries.insert(
                    (batch_id, kind),
                    CacheEntry {
                        value: value.clone(),
                        expires_at: now + self.ttl,
                    },
                );
            } else {
                self.metrics.stale_discards.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    batch_id,
                    ?kind,
                    "batch changed during computation; result not cached"
                );
            }
        }
        Ok(value)
    }

    /// Drops every entry for `batch_id`, whatever its kind or remaining TTL.
    pub fn invalidate(&self, batch_id: BatchId) {
        let Ok(mut state) = self.state.write() else {
            tracing::error!(batch_id, "aggregate cache lock poisoned during invalidation");
            return;
        };
        *state.generations.entry(batch_id).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|(entry_batch, _), _| *entry_batch != batch_id);
        let removed = before - state.entries.len();
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(batch_id, removed, "aggregate cache invalidated");
    }

    /// Removes entries whose TTL has run out. Every insert does this too, so
    /// the map never holds more expired entries than the last insert saw.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };
        state.purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            stale_discards: self.metrics.stale_discards.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::Cell,
        convert::Infallible,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Months,
        Ages,
    }

    const LONG: Duration = Duration::from_secs(60);

    fn ok(value: u32) -> Result<u32, Infallible> {
        Ok(value)
    }

    #[test]
    fn second_lookup_is_served_from_cache() {
        let cache = ResultCache::new(LONG);
        let calls = Cell::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_compute(1, Kind::Months, || {
                    calls.set(calls.get() + 1);
                    ok(10)
                })
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.get(), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
    }

    #[test]
    fn kinds_and_batches_are_cached_separately() {
        let cache = ResultCache::new(LONG);
        cache.get_or_compute(1, Kind::Months, || ok(1)).unwrap();
        cache.get_or_compute(1, Kind::Ages, || ok(2)).unwrap();
        cache.get_or_compute(2, Kind::Months, || ok(3)).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_or_compute(1, Kind::Ages, || ok(99)).unwrap(), 2);
    }

    #[test]
    fn invalidate_drops_every_kind_of_one_batch() {
        let cache = ResultCache::new(LONG);
        cache.get_or_compute(1, Kind::Months, || ok(1)).unwrap();
        cache.get_or_compute(1, Kind::Ages, || ok(2)).unwrap();
        cache.get_or_compute(2, Kind::Months, || ok(3)).unwrap();

        cache.invalidate(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_or_compute(1, Kind::Months, || ok(11)).unwrap(), 11);
        assert_eq!(cache.get_or_compute(2, Kind::Months, || ok(33)).unwrap(), 3);
    }

    #[test]
    fn expired_entry_is_recomputed() {
        let cache = ResultCache::new(Duration::from_millis(5));
        cache.get_or_compute(1, Kind::Months, || ok(1)).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get_or_compute(1, Kind::Months, || ok(2)).unwrap(), 2);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn inserts_sweep_expired_entries_of_other_batches() {
        let cache = ResultCache::new(Duration::from_millis(5));
        cache.get_or_compute(1, Kind::Months, || ok(1)).unwrap();
        cache.get_or_compute(2, Kind::Ages, || ok(2)).unwrap();
        std::thread::sleep(Duration::from_millis(15));

        cache.get_or_compute(3, Kind::Months, || ok(3)).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache: ResultCache<Kind, u32> = ResultCache::new(LONG);
        let failed: Result<u32, &str> = cache.get_or_compute(1, Kind::Ages, || Err("boom"));
        assert_eq!(failed, Err("boom"));
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_compute(1, Kind::Ages, || ok(4)).unwrap(), 4);
    }

    #[test]
    fn result_computed_across_invalidation_is_not_stored() {
        let cache = ResultCache::new(LONG);
        let value = cache
            .get_or_compute(1, Kind::Months, || {
                cache.invalidate(1);
                ok(1)
            })
            .unwrap();
        assert_eq!(value, 1);
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().stale_discards, 1);

        assert_eq!(cache.get_or_compute(1, Kind::Months, || ok(2)).unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }
}
