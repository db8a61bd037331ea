// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Generic size-accounted LRU (Least Recently Used) cache.
//!
//! This module provides an LRU cache with a pluggable size metric, an
//! optional miss-fill hook, and an optional removal listener. It uses
//! `FxHashMap` for fast lookups and tracks access patterns with a monotonic
//! counter to evict the least recently used entries when the size bound is
//! exceeded.
//!
//! ## Features
//!
//! - Generic over key and value types
//! - True LRU eviction using access counters
//! - Size accounting via a caller-supplied [`sizer`] (default: 1 per entry)
//! - Miss-fill via a caller-supplied [`creator`] hook
//! - Removal notification via a caller-supplied [`removal_listener`]
//! - Interior locking: share the cache across threads behind an `Arc`
//!
//! ## Locking discipline
//!
//! All map mutations happen under one internal mutex. The user-facing hooks
//! (`sizer` aside, which is called under the lock and must be cheap and
//! stable) run with **no lock held**, so a hook may re-enter the same cache.
//! This is what makes the [`get`] miss-fill path racy by design: between the
//! `creator` call and re-acquiring the lock, a concurrent [`put`] may insert
//! a value for the same key. The raced-in value wins; the created value is
//! discarded through the removal listener with `evicted = false`.
//!
//! ## Performance
//!
//! The cache uses [`rustc_hash::FxHashMap`] which provides 3-5x faster
//! lookups compared to the standard [`std::collections::HashMap`]. Keys are
//! assumed to be trusted internal data, not user input.
//!
//! [`creator`]: LruCacheBuilder::creator
//! [`get`]: LruCache::get
//! [`put`]: LruCache::put
//! [`removal_listener`]: LruCacheBuilder::removal_listener
//! [`sizer`]: LruCacheBuilder::sizer

use std::{fmt, hash::Hash, sync::Mutex};

use rustc_hash::{FxBuildHasher, FxHashMap};

/// Computes the charge of an entry. Must be cheap, and stable for the
/// lifetime of the entry.
pub type Sizer<K, V> = Box<dyn Fn(&K, &V) -> usize + Send + Sync>;

/// Computes a value for a missing key. Runs with no lock held.
pub type Creator<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// Invoked after an entry leaves the map, with no lock held.
///
/// Arguments are `(evicted, key, old_value, new_value)`:
/// - `evicted = true`: the entry was removed to satisfy the size bound.
/// - `evicted = false`: the entry was replaced by [`LruCache::put`], removed
///   by [`LruCache::remove`], or was a created value discarded after a
///   racing `put` (in which case `new_value` is the raced-in winner).
pub type RemovalListener<K, V> = Box<dyn Fn(bool, &K, V, Option<&V>) + Send + Sync>;

/// Entry in the LRU cache containing the value and access metadata.
struct CacheEntry<V> {
    value: V,
    access_count: u64,
}

/// Map state guarded by the cache's internal mutex.
struct LruState<K, V> {
    map: FxHashMap<K, CacheEntry<V>>,
    size: usize,
    max_size: usize,
    access_counter: u64,
    put_count: usize,
    hit_count: usize,
    miss_count: usize,
    create_count: usize,
    eviction_count: usize,
}

/// A size-accounted LRU (Least Recently Used) cache.
///
/// After any mutating operation returns, `size == Σ sizer(k, v)` over the
/// present entries and `size <= max_size`. When an insertion pushes the
/// total over the bound, least recently accessed entries are evicted until
/// it holds again, and each victim is reported through the removal listener
/// exactly once with `evicted = true`.
pub struct LruCache<K, V> {
    state: Mutex<LruState<K, V>>,
    sizer: Sizer<K, V>,
    creator: Option<Creator<K, V>>,
    removal_listener: Option<RemovalListener<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a cache with the given size bound, counting each entry as 1.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0.
    #[must_use]
    pub fn new(max_size: usize) -> Self { Self::builder(max_size).build() }

    /// Starts building a cache with a custom sizer / creator / listener.
    #[must_use]
    pub fn builder(max_size: usize) -> LruCacheBuilder<K, V> {
        LruCacheBuilder {
            max_size,
            sizer: None,
            creator: None,
            removal_listener: None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState<K, V>> {
        self.state.lock().expect("LruCache mutex poisoned")
    }

    /// Returns the value for `key`, promoting it to most recently used.
    ///
    /// On a miss the `creator` hook (if any) is invoked **without the lock
    /// held** to compute a value. If a concurrent [`put`] raced a value in
    /// for the same key while `creator` ran, the raced-in value is kept and
    /// returned, and the created value is handed to the removal listener
    /// with `evicted = false` and the raced-in value as `new_value`.
    ///
    /// [`put`]: Self::put
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.access_counter += 1;
            let counter = state.access_counter;
            if let Some(entry) = state.map.get_mut(key) {
                entry.access_count = counter;
                state.hit_count += 1;
                return Some(entry.value.clone());
            }
            state.miss_count += 1;
        }

        let created = (self.creator.as_ref()?)(key)?;

        let mut victims = Vec::new();
        let raced = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.create_count += 1;
            state.access_counter += 1;
            let counter = state.access_counter;
            if let Some(entry) = state.map.get_mut(key) {
                entry.access_count = counter;
                Some(entry.value.clone())
            } else {
                state.size += (self.sizer)(key, &created);
                state.map.insert(key.clone(), CacheEntry {
                    value: created.clone(),
                    access_count: counter,
                });
                let target = state.max_size;
                self.trim_locked(state, target, &mut victims);
                None
            }
        };

        match raced {
            Some(winner) => {
                if let Some(listener) = &self.removal_listener {
                    listener(false, key, created, Some(&winner));
                }
                Some(winner)
            }
            None => {
                self.notify_evicted(victims);
                Some(created)
            }
        }
    }

    /// Inserts or replaces the value for `key`, then trims to the bound.
    ///
    /// Returns the previous value, if any. A replaced value is also reported
    /// through the removal listener with `evicted = false` and the new value
    /// as `new_value`.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut victims = Vec::new();
        let previous = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.put_count += 1;
            state.access_counter += 1;
            let counter = state.access_counter;
            state.size += (self.sizer)(&key, &value);
            let previous = state
                .map
                .insert(key.clone(), CacheEntry {
                    value: value.clone(),
                    access_count: counter,
                })
                .map(|entry| entry.value);
            if let Some(old) = &previous {
                state.size = self.debit(state.size, &key, old);
            }
            let target = state.max_size;
            self.trim_locked(state, target, &mut victims);
            previous
        };

        if let Some(old) = &previous {
            if let Some(listener) = &self.removal_listener {
                listener(false, &key, old.clone(), Some(&value));
            }
        }
        self.notify_evicted(victims);
        previous
    }

    /// Removes the entry for `key`, if present, and returns its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state.map.remove(key)?;
            state.size = self.debit(state.size, key, &entry.value);
            Some(entry.value)
        };

        if let Some(old) = &removed {
            if let Some(listener) = &self.removal_listener {
                listener(false, key, old.clone(), None);
            }
        }
        removed
    }

    /// Changes the size bound, evicting oldest entries if it shrank.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0.
    pub fn resize(&self, max_size: usize) {
        assert!(max_size > 0, "Cache max_size must be greater than 0");
        let mut victims = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.max_size = max_size;
            self.trim_locked(state, max_size, &mut victims);
        }
        self.notify_evicted(victims);
    }

    /// Evicts oldest entries until `size <= target`, without changing the
    /// configured bound. `trim_to_size(0)` empties the cache.
    pub fn trim_to_size(&self, target: usize) {
        let mut victims = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            self.trim_locked(state, target, &mut victims);
        }
        self.notify_evicted(victims);
    }

    /// Evicts least recently used entries under the lock, collecting victims
    /// so the listener can run after the lock is released.
    fn trim_locked(&self, state: &mut LruState<K, V>, target: usize, victims: &mut Vec<(K, V)>) {
        while state.size > target {
            assert!(
                !state.map.is_empty(),
                "LruCache sizer is reporting inconsistent results"
            );
            let victim_key = state
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(k, _)| k.clone());
            let Some(victim_key) = victim_key else { break };
            if let Some(entry) = state.map.remove(&victim_key) {
                state.size = self.debit(state.size, &victim_key, &entry.value);
                state.eviction_count += 1;
                victims.push((victim_key, entry.value));
            }
        }
    }

    /// Subtracts an entry's charge from the running total, failing loudly if
    /// the sizer changed its answer over the entry's lifetime.
    fn debit(&self, size: usize, key: &K, value: &V) -> usize {
        let charge = (self.sizer)(key, value);
        size.checked_sub(charge)
            .expect("LruCache sizer is reporting inconsistent results")
    }

    fn notify_evicted(&self, victims: Vec<(K, V)>) {
        if let Some(listener) = &self.removal_listener {
            for (key, value) in victims {
                listener(true, &key, value, None);
            }
        }
    }

    /// Current total charge of all present entries.
    #[must_use]
    pub fn size(&self) -> usize { self.lock().size }

    /// Configured size bound.
    #[must_use]
    pub fn max_size(&self) -> usize { self.lock().max_size }

    /// Number of present entries.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().map.len() }

    /// Returns true if no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().map.is_empty() }

    /// Returns true if `key` is present, without promoting it.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool { self.lock().map.contains_key(key) }

    /// Number of times [`get`](Self::get) found the key present.
    #[must_use]
    pub fn hit_count(&self) -> usize { self.lock().hit_count }

    /// Number of times [`get`](Self::get) missed.
    #[must_use]
    pub fn miss_count(&self) -> usize { self.lock().miss_count }

    /// Number of [`put`](Self::put) calls.
    #[must_use]
    pub fn put_count(&self) -> usize { self.lock().put_count }

    /// Number of times the creator hook produced a value.
    #[must_use]
    pub fn create_count(&self) -> usize { self.lock().create_count }

    /// Number of entries evicted to satisfy the size bound.
    #[must_use]
    pub fn eviction_count(&self) -> usize { self.lock().eviction_count }

    /// Copy of the current entries ordered least to most recently accessed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let guard = self.lock();
        let mut entries: Vec<_> = guard
            .map
            .iter()
            .map(|(k, entry)| (entry.access_count, k.clone(), entry.value.clone()))
            .collect();
        entries.sort_by_key(|(access, _, _)| *access);
        entries.into_iter().map(|(_, k, v)| (k, v)).collect()
    }
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(guard) = self.state.lock() else {
            return write!(f, "LruCache[poisoned]");
        };
        let accesses = guard.hit_count + guard.miss_count;
        let hit_rate = if accesses == 0 {
            0
        } else {
            100 * guard.hit_count / accesses
        };
        write!(
            f,
            "LruCache[maxSize={},size={},hits={},misses={},hitRate={hit_rate}%]",
            guard.max_size, guard.size, guard.hit_count, guard.miss_count
        )
    }
}

/// Builder for [`LruCache`] with a custom sizer, creator, or listener.
pub struct LruCacheBuilder<K, V> {
    max_size: usize,
    sizer: Option<Sizer<K, V>>,
    creator: Option<Creator<K, V>>,
    removal_listener: Option<RemovalListener<K, V>>,
}

impl<K, V> LruCacheBuilder<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Replaces the default 1-per-entry size metric.
    ///
    /// The sizer must be stable: it is consulted again when an entry leaves
    /// the map, and a changed answer makes the size accounting panic.
    #[must_use]
    pub fn sizer(mut self, sizer: impl Fn(&K, &V) -> usize + Send + Sync + 'static) -> Self {
        self.sizer = Some(Box::new(sizer));
        self
    }

    /// Installs a miss-fill hook consulted by [`LruCache::get`].
    #[must_use]
    pub fn creator(mut self, creator: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        self.creator = Some(Box::new(creator));
        self
    }

    /// Installs a removal listener. See [`RemovalListener`] for the calling
    /// convention.
    #[must_use]
    pub fn removal_listener(
        mut self,
        listener: impl Fn(bool, &K, V, Option<&V>) + Send + Sync + 'static,
    ) -> Self {
        self.removal_listener = Some(Box::new(listener));
        self
    }

    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics if the size bound is 0.
    #[must_use]
    pub fn build(self) -> LruCache<K, V> {
        assert!(self.max_size > 0, "Cache max_size must be greater than 0");
        LruCache {
            state: Mutex::new(LruState {
                map: FxHashMap::with_hasher(FxBuildHasher),
                size: 0,
                max_size: self.max_size,
                access_counter: 0,
                put_count: 0,
                hit_count: 0,
                miss_count: 0,
                create_count: 0,
                eviction_count: 0,
            }),
            sizer: self.sizer.unwrap_or_else(|| Box::new(|_, _| 1)),
            creator: self.creator,
            removal_listener: self.removal_listener,
        }
    }
}

impl<K, V> fmt::Debug for LruCacheBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCacheBuilder")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex, OnceLock};

    #[test]
    fn test_basic_operations() {
        let cache = LruCache::new(3);

        // Test put and get.
        assert_eq!(cache.put("a".to_string(), 1), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 1);

        // Test replace.
        assert_eq!(cache.put("a".to_string(), 2), Some(1));
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 1);

        // Test multiple inserts.
        cache.put("b".to_string(), 3);
        cache.put("c".to_string(), 4);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.max_size(), 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        // put(A), put(B), get(A), put(C) with bound 2: B is the victim.
        let evictions = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&evictions);
        let cache = LruCache::builder(2)
            .removal_listener(move |evicted, key: &String, _old, _new| {
                if evicted {
                    log.lock().unwrap().push(key.clone());
                }
            })
            .build();

        cache.put("A".to_string(), 1);
        cache.put("B".to_string(), 2);
        assert_eq!(cache.get(&"A".to_string()), Some(1));
        cache.put("C".to_string(), 3);

        assert!(cache.contains_key(&"A".to_string()));
        assert!(cache.contains_key(&"C".to_string()));
        assert!(!cache.contains_key(&"B".to_string()));
        assert_eq!(*evictions.lock().unwrap(), vec!["B".to_string()]);
        assert_eq!(cache.eviction_count(), 1);
    }

    #[test]
    fn test_size_accounting_with_custom_sizer() {
        let cache: LruCache<String, String> = LruCache::builder(10)
            .sizer(|_key, value: &String| value.len())
            .build();

        cache.put("a".to_string(), "12345".to_string());
        cache.put("b".to_string(), "1234".to_string());
        assert_eq!(cache.size(), 9);

        // Inserting 3 more units pushes the total to 12; "a" (oldest) goes.
        cache.put("c".to_string(), "123".to_string());
        assert_eq!(cache.size(), 7);
        assert!(!cache.contains_key(&"a".to_string()));

        cache.remove(&"b".to_string());
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn test_replace_notifies_listener_with_new_value() {
        let replaced = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&replaced);
        let cache = LruCache::builder(4)
            .removal_listener(move |evicted, key: &String, old, new: Option<&i32>| {
                log.lock().unwrap().push((evicted, key.clone(), old, new.copied()));
            })
            .build();

        cache.put("k".to_string(), 1);
        cache.put("k".to_string(), 2);

        let log = replaced.lock().unwrap();
        assert_eq!(log.as_slice(), &[(false, "k".to_string(), 1, Some(2))]);
    }

    #[test]
    fn test_creator_fills_misses() {
        let cache = LruCache::builder(4)
            .creator(|key: &String| Some(key.len()))
            .build();

        assert_eq!(cache.get(&"four".to_string()), Some(4));
        assert_eq!(cache.create_count(), 1);
        assert_eq!(cache.miss_count(), 1);

        // Second access is a plain hit.
        assert_eq!(cache.get(&"four".to_string()), Some(4));
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.create_count(), 1);
    }

    #[test]
    fn test_get_without_creator_returns_none() {
        let cache: LruCache<String, i32> = LruCache::new(4);
        assert_eq!(cache.get(&"missing".to_string()), None);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn test_racing_put_wins_over_created_value() {
        // The creator re-enters the cache (it runs with no lock held) and
        // puts a value for the same key, simulating a concurrent writer
        // sneaking in between the creator call and the re-lock.
        let cache_slot: Arc<OnceLock<Arc<LruCache<String, i32>>>> = Arc::new(OnceLock::new());
        let discarded = Arc::new(StdMutex::new(Vec::new()));

        let slot = Arc::clone(&cache_slot);
        let log = Arc::clone(&discarded);
        let cache = Arc::new(
            LruCache::builder(4)
                .creator(move |key: &String| {
                    let cache = slot.get().unwrap();
                    cache.put(key.clone(), 100);
                    Some(1)
                })
                .removal_listener(move |evicted, key: &String, old, new: Option<&i32>| {
                    log.lock().unwrap().push((evicted, key.clone(), old, new.copied()));
                })
                .build(),
        );
        cache_slot.set(Arc::clone(&cache)).unwrap();

        // The raced-in value wins; the created one is discarded.
        assert_eq!(cache.get(&"x".to_string()), Some(100));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 1);
        assert_eq!(
            discarded.lock().unwrap().as_slice(),
            &[(false, "x".to_string(), 1, Some(100))]
        );
    }

    #[test]
    fn test_resize_and_trim_to_size() {
        let cache = LruCache::new(4);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.put((*key).to_string(), i);
        }

        cache.resize(2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key(&"c".to_string()));
        assert!(cache.contains_key(&"d".to_string()));
        assert_eq!(cache.max_size(), 2);

        // trim_to_size(0) empties without changing the bound.
        cache.trim_to_size(0);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.max_size(), 2);
    }

    #[test]
    fn test_snapshot_orders_least_to_most_recent() {
        let cache = LruCache::new(4);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);
        cache.get(&"a".to_string());

        let keys: Vec<String> = cache.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    }

    #[test]
    #[should_panic(expected = "Cache max_size must be greater than 0")]
    fn test_zero_max_size_panics() { let _cache = LruCache::<String, i32>::new(0); }

    #[test]
    #[should_panic(expected = "inconsistent results")]
    fn test_unstable_sizer_panics() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let cache: LruCache<String, i32> = LruCache::builder(10)
            .sizer(move |_, _| {
                // Grows on every call, so the debit on removal underflows.
                calls.fetch_add(2, Ordering::Relaxed)
            })
            .build();
        cache.put("a".to_string(), 1);
        cache.remove(&"a".to_string());
    }
}
