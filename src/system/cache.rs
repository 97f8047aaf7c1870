//! Thread-safe LRU cache with optional per-entry TTL.
//!
//! - One mutex guards the recency list and the map, so exactly one structural
//!   mutation runs at a time.
//! - `max_entries == 0` means unbounded; otherwise every insert that leaves the
//!   cache over capacity evicts the single least-recently-used entry.
//! - Expiry is lazy. `get` removes an expired entry it finds, `peek` and `each`
//!   only report it as absent; `purge_expired` sweeps them all.

use crate::system::clock::{Clock, SystemClock};
use crate::system::fanout;
use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Hit/miss counters plus the size at the time they were read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hit: u64,
    pub miss: u64,
}

/// Called with the key and value of every entry that leaves the cache for a
/// reason other than being replaced. Runs while the cache lock is held.
pub type OnEvicted<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    expire_at_ms: Option<u64>,
}

impl<V> Entry<V> {
    #[inline]
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at_ms.is_some_and(|at| at < now_ms)
    }
}

struct Inner<K: Hash + Eq, V> {
    lru: LruCache<K, Entry<V>>,
    stats: CacheStats,
}

pub struct TtlLruCache<K, V>
where
    K: Hash + Eq,
{
    max_entries: usize,
    on_evicted: Option<OnEvicted<K, V>>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_entries,
            on_evicted: None,
            clock,
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn with_on_evicted<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.on_evicted = Some(Box::new(f));
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn evicted(&self, key: &K, entry: &Entry<V>) {
        if let Some(cb) = &self.on_evicted {
            cb(key, &entry.value);
        }
    }

    /// Insert or replace `key`, returning whether it was already present.
    pub fn add(&self, key: K, value: V) -> bool {
        self.insert(key, Entry {
            value,
            expire_at_ms: None,
        })
    }

    /// Like [`add`](Self::add), but the entry expires after `ttl`.
    pub fn add_with_ttl(&self, key: K, value: V, ttl: Duration) -> bool {
        let expire_at_ms = self.expire_at(ttl);
        self.insert(key, Entry {
            value,
            expire_at_ms: Some(expire_at_ms),
        })
    }

    #[inline]
    fn expire_at(&self, ttl: Duration) -> u64 {
        self.clock
            .now_ms()
            .saturating_add(ttl.as_millis() as u64)
    }

    fn insert(&self, key: K, entry: Entry<V>) -> bool {
        let mut inner = self.lock();
        let existed = inner.lru.put(key, entry).is_some();
        if !existed {
            self.trim(&mut inner);
        }
        existed
    }

    fn trim(&self, inner: &mut Inner<K, V>) {
        if self.max_entries != 0 && inner.lru.len() > self.max_entries {
            if let Some((key, entry)) = inner.lru.pop_lru() {
                self.evicted(&key, &entry);
            }
        }
    }

    /// Return the live value for `key`, or insert the one built by `init`
    /// with an expiry of `now + ttl`.
    ///
    /// The lookup and the insert happen under one lock, so concurrent callers
    /// for the same key always end up sharing a single value. A hit leaves the
    /// expiry where it was.
    pub fn get_or_add_with_ttl<Q, F>(&self, key: &Q, ttl: Duration, init: F) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        self.get_or_add(key, ttl, false, init)
    }

    /// Like [`get_or_add_with_ttl`](Self::get_or_add_with_ttl), but a hit
    /// pushes the expiry out to `now + ttl` (never pulls it in), so the entry
    /// lives until `ttl` after its last use.
    pub fn touch_or_add_with_ttl<Q, F>(&self, key: &Q, ttl: Duration, init: F) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        self.get_or_add(key, ttl, true, init)
    }

    fn get_or_add<Q, F>(&self, key: &Q, ttl: Duration, slide: bool, init: F) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        let now_ms = self.clock.now_ms();
        let expire_at_ms = now_ms.saturating_add(ttl.as_millis() as u64);
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(entry) = inner.lru.get_mut(key) {
            if !entry.is_expired(now_ms) {
                if slide {
                    if let Some(at) = entry.expire_at_ms.as_mut() {
                        *at = (*at).max(expire_at_ms);
                    }
                }
                let value = entry.value.clone();
                inner.stats.hit += 1;
                return value;
            }
        }
        inner.stats.miss += 1;

        let value = init();
        let entry = Entry {
            value: value.clone(),
            expire_at_ms: Some(expire_at_ms),
        };
        if let Some((old_key, old)) = inner.lru.push(key.to_owned(), entry) {
            // the expired entry we just replaced
            self.evicted(&old_key, &old);
        } else {
            self.trim(inner);
        }
        value
    }

    /// Push the expiry of a live `key` out to at least `now + ttl`, without
    /// touching recency. Returns false if the key is absent or expired.
    pub fn extend_ttl<Q>(&self, key: &Q, ttl: Duration) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now_ms = self.clock.now_ms();
        let expire_at_ms = now_ms.saturating_add(ttl.as_millis() as u64);
        let mut inner = self.lock();
        match inner.lru.peek_mut(key) {
            Some(entry) if !entry.is_expired(now_ms) => {
                if let Some(at) = entry.expire_at_ms.as_mut() {
                    *at = (*at).max(expire_at_ms);
                }
                true
            }
            _ => false,
        }
    }

    /// Remove every expired entry, firing the eviction callback for each.
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();
        let expired: Vec<K> = inner
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.lru.pop(key) {
                self.evicted(key, &entry);
            }
        }
        expired.len()
    }

    /// Look up `key` and mark it most recently used.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now_ms = self.clock.now_ms();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.lru.peek(key) {
            Some(entry) => entry.is_expired(now_ms),
            None => {
                inner.stats.miss += 1;
                return None;
            }
        };

        if expired {
            if let Some((k, entry)) = inner.lru.pop_entry(key) {
                self.evicted(&k, &entry);
            }
            inner.stats.miss += 1;
            return None;
        }

        inner.stats.hit += 1;
        inner.lru.get(key).map(|entry| entry.value.clone())
    }

    /// Look up `key` without touching recency, stats, or expired entries.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now_ms = self.clock.now_ms();
        let inner = self.lock();
        inner
            .lru
            .peek(key)
            .filter(|entry| !entry.is_expired(now_ms))
            .map(|entry| entry.value.clone())
    }

    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.lock();
        if let Some((k, entry)) = inner.lru.pop_entry(key) {
            self.evicted(&k, &entry);
        }
    }

    pub fn size(&self) -> usize {
        self.lock().lru.len()
    }

    /// Read the counters and reset hit/miss.
    pub fn stats(&self) -> CacheStats {
        let mut inner = self.lock();
        let stats = CacheStats {
            size: inner.lru.len(),
            ..inner.stats
        };
        inner.stats = CacheStats::default();
        stats
    }

    /// Keys present right now, most recently used first.
    pub fn keys(&self) -> Vec<K> {
        self.lock().lru.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Apply `f` to every entry present when the call starts, with at most
    /// `concurrency` calls running at once.
    ///
    /// The cache stays usable meanwhile: each key is re-read with
    /// [`peek`](Self::peek) right before `f` runs, and keys that vanished or
    /// expired in between are skipped. Returns every error `f` produced.
    pub fn each<E, F>(&self, concurrency: usize, f: F) -> Vec<E>
    where
        K: Send + Sync,
        V: Send,
        E: Send,
        F: Fn(&K, V) -> Result<(), E> + Sync,
    {
        let keys = self.keys();
        fanout::run(concurrency, keys, |key| match self.peek(&key) {
            Some(value) => f(&key, value),
            None => Ok(()),
        })
    }

    /// Visit every entry while holding the cache lock; entries for which
    /// `f` returns `false` are removed.
    ///
    /// Blocks every other cache operation until it returns, so keep it for
    /// diagnostics.
    pub fn map<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.lock();
        let doomed: Vec<K> = inner
            .lru
            .iter()
            .filter(|(k, entry)| !f(k, &entry.value))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = inner.lru.pop(&key) {
                self.evicted(&key, &entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with_clock(max: usize) -> (TtlLruCache<u64, u64>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (TtlLruCache::with_clock(max, clock.clone()), clock)
    }

    #[test]
    fn test_add_reports_existing_key() {
        let cache = TtlLruCache::new(0);
        assert!(!cache.add("a", 1));
        assert!(cache.add("a", 2), "second add of the same key must report it existed");
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lru_bound_keeps_most_recent() {
        let (cache, _) = cache_with_clock(3);
        for k in 0..8 {
            cache.add(k, k * 10);
        }
        assert_eq!(cache.size(), 3);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec![5, 6, 7]);
    }

    #[test]
    fn test_get_promotes_and_peek_does_not() {
        let (cache, _) = cache_with_clock(2);
        cache.add(1, 1);
        cache.add(2, 2);

        // peek must not save key 1
        assert_eq!(cache.peek(&1), Some(1));
        cache.add(3, 3);
        assert_eq!(cache.peek(&1), None, "1 was least recently used and should be gone");

        // get promotes key 2, so 3 is now the oldest
        assert_eq!(cache.get(&2), Some(2));
        cache.add(4, 4);
        assert_eq!(cache.peek(&3), None);
        assert_eq!(cache.peek(&2), Some(2));
    }

    #[test]
    fn test_ttl_get_removes_expired_entry() {
        let (cache, clock) = cache_with_clock(0);
        cache.add_with_ttl(7, 70, Duration::from_secs(10));
        cache.add(8, 80);

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get(&7), Some(70), "expiry is strictly after expire_at");

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.peek(&7), None);
        assert_eq!(cache.size(), 2, "peek must not remove the expired entry");

        assert_eq!(cache.get(&7), None);
        assert_eq!(cache.size(), 1, "get must remove the expired entry");
        assert_eq!(cache.keys(), vec![8]);
    }

    #[test]
    fn test_eviction_callback_fires_on_capacity_remove_and_expiry() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let clock = Arc::new(ManualClock::new(0));
        let cache = TtlLruCache::with_clock(2, clock.clone()).with_on_evicted(move |_k: &u8, _v: &u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.add(1, 1);
        cache.add(1, 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 0, "replacing is not an eviction");

        cache.add(2, 2);
        cache.add(3, 3);
        assert_eq!(evicted.load(Ordering::SeqCst), 1, "capacity eviction");

        cache.remove(&2);
        assert_eq!(evicted.load(Ordering::SeqCst), 2, "explicit removal");

        cache.add_with_ttl(4, 4, Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&4), None);
        assert_eq!(evicted.load(Ordering::SeqCst), 3, "lazy expiry");
    }

    #[test]
    fn test_get_or_add_with_ttl_shares_one_value() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: TtlLruCache<u64, Arc<AtomicUsize>> =
            TtlLruCache::with_clock(0, clock.clone());

        let a = cache.get_or_add_with_ttl(&1, Duration::from_secs(5), || Arc::new(AtomicUsize::new(0)));
        let b = cache.get_or_add_with_ttl(&1, Duration::from_secs(5), || Arc::new(AtomicUsize::new(99)));
        a.fetch_add(1, Ordering::SeqCst);
        assert_eq!(b.load(Ordering::SeqCst), 1, "both callers must see the same value");

        clock.advance(Duration::from_secs(6));
        let c = cache.get_or_add_with_ttl(&1, Duration::from_secs(5), || Arc::new(AtomicUsize::new(42)));
        assert_eq!(c.load(Ordering::SeqCst), 42, "expired entry must be replaced");
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_touch_or_add_with_ttl_slides_expiry_forward_only() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: TtlLruCache<String, u32> = TtlLruCache::with_clock(0, clock.clone());

        cache.touch_or_add_with_ttl("ip", Duration::from_secs(60), || 1);
        clock.advance(Duration::from_secs(50));
        // hit at t=50 keeps the entry alive until t=110
        cache.touch_or_add_with_ttl("ip", Duration::from_secs(60), || 2);
        clock.advance(Duration::from_secs(50));
        assert_eq!(cache.peek("ip"), Some(1), "a hit must extend the expiry");

        // a longer ttl wins, a later shorter one does not shrink it
        cache.touch_or_add_with_ttl("ip", Duration::from_secs(600), || 3);
        cache.touch_or_add_with_ttl("ip", Duration::from_secs(1), || 4);
        clock.advance(Duration::from_secs(300));
        assert_eq!(cache.peek("ip"), Some(1));
    }

    #[test]
    fn test_get_or_add_with_ttl_keeps_creation_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: TtlLruCache<u64, u32> = TtlLruCache::with_clock(0, clock.clone());

        cache.get_or_add_with_ttl(&9, Duration::from_secs(60), || 1);
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get_or_add_with_ttl(&9, Duration::from_secs(60), || 2), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.peek(&9), Some(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.peek(&9), None, "hits must not move the expiry");
    }

    #[test]
    fn test_extend_ttl() {
        let (cache, clock) = cache_with_clock(2);
        cache.add_with_ttl(1, 10, Duration::from_secs(10));
        cache.add(2, 20);

        assert!(cache.extend_ttl(&1, Duration::from_secs(100)));
        assert!(cache.extend_ttl(&1, Duration::from_secs(5)), "shorter ttl is a no-op");
        clock.advance(Duration::from_secs(100));
        assert_eq!(cache.peek(&1), Some(10));

        // recency is untouched: 1 is still the oldest
        cache.add(3, 30);
        assert_eq!(cache.peek(&1), None);
        assert!(!cache.extend_ttl(&1, Duration::from_secs(5)));
    }

    #[test]
    fn test_purge_expired_fires_callback() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let clock = Arc::new(ManualClock::new(0));
        let cache = TtlLruCache::with_clock(0, clock.clone()).with_on_evicted(move |k: &u8, _v: &u8| {
            sink.lock().unwrap().push(*k);
        });
        cache.add_with_ttl(1, 1, Duration::from_secs(1));
        cache.add_with_ttl(2, 2, Duration::from_secs(10));
        cache.add(3, 3);

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(*evicted.lock().unwrap(), vec![1]);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn test_stats_count_and_reset() {
        let cache = TtlLruCache::new(0);
        cache.add("x", 1);
        let _ = cache.get(&"x");
        let _ = cache.get(&"y");
        let _ = cache.peek(&"x");

        let stats = cache.stats();
        assert_eq!(stats, CacheStats { size: 1, hit: 1, miss: 1 });
        assert_eq!(cache.stats(), CacheStats { size: 1, hit: 0, miss: 0 });
    }

    #[test]
    fn test_each_skips_vanished_and_collects_errors() {
        let (cache, clock) = cache_with_clock(0);
        for k in 0..20 {
            cache.add(k, k);
        }
        cache.add_with_ttl(100, 100, Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let seen = AtomicUsize::new(0);
        let errors = cache.each(4, |k, v| {
            assert_eq!(*k, v);
            seen.fetch_add(1, Ordering::SeqCst);
            if *k == 3 { Err(format!("bad {k}")) } else { Ok(()) }
        });

        assert_eq!(seen.load(Ordering::SeqCst), 20, "expired key 100 must be skipped");
        assert_eq!(errors, vec!["bad 3".to_string()]);
    }

    #[test]
    fn test_map_removes_rejected_entries() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let cache = TtlLruCache::new(0).with_on_evicted(move |_k: &u32, _v: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for k in 0..10u32 {
            cache.add(k, k);
        }

        let mut visited = 0;
        cache.map(|_, v| {
            visited += 1;
            v % 2 == 0
        });

        assert_eq!(visited, 10);
        assert_eq!(cache.size(), 5);
        assert_eq!(evicted.load(Ordering::SeqCst), 5);
        assert!(cache.keys().iter().all(|k| k % 2 == 0));
    }
}
