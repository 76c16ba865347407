//! Process-wide, size-bounded, TTL'd caches (§5, §9)
//!
//! Backs both the rewrite cache (§4.7 step 2) and the candidate hot-set cache
//! (§4.7 step 4). Safe for concurrent `get`/`set`; entries evict FIFO once the
//! bound is hit, mirroring the teacher's `DashMap`-backed result cache in
//! `search::result_cache::SearchResultCache`.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A bounded, TTL'd, FIFO-evicting cache keyed by `K`
pub struct BoundedCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    order: Mutex<VecDeque<K>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity,
            ttl,
        }
    }

    /// Fetch a live entry, returning a defensive clone so callers can't mutate
    /// the cached value in place (§5 "Readers receive a defensive copy").
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or replace an entry, evicting the oldest entry FIFO on overflow (§4.7, §9)
    pub fn set(&self, key: K, value: V) {
        let is_new = !self.entries.contains_key(&key);
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );

        if is_new {
            let mut order = self.order.lock();
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedCache<K, V> = Arc<BoundedCache<K, V>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_on_overflow() {
        let cache: BoundedCache<String, i32> = BoundedCache::new(2, Duration::from_secs(30));
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.set("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a".to_string()).is_none());
        assert_eq!(cache.get(&"b".to_string()), Some(2));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn ttl_expiry() {
        let cache: BoundedCache<String, i32> = BoundedCache::new(10, Duration::from_millis(10));
        cache.set("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn overwrite_keeps_insertion_slot() {
        let cache: BoundedCache<String, i32> = BoundedCache::new(2, Duration::from_secs(30));
        cache.set("a".to_string(), 1);
        cache.set("a".to_string(), 2);
        cache.set("b".to_string(), 3);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 2);
    }
}
