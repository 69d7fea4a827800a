//! Bounded LRU map with compare-and-put.
//!
//! Values are held as `Arc<V>` and compared by pointer identity, so a caller
//! that read an entry can replace it only if nobody replaced it since.
//! Recency is a logical clock bumped on every access; eviction scans for the
//! smallest tick.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot<V> {
    value: Arc<V>,
    last_access: AtomicU64,
}

impl<V> Slot<V> {
    fn new(value: Arc<V>, clock: u64) -> Self {
        Self {
            value,
            last_access: AtomicU64::new(clock),
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

fn same<V>(current: Option<&Arc<V>>, expected: Option<&Arc<V>>) -> bool {
    match (current, expected) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

pub struct LruCache<K, V> {
    entries: RwLock<HashMap<K, Slot<V>>>,
    capacity: usize,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries dropped to make room
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read();
        let slot = entries.get(key)?;
        slot.touch(self.tick());
        Some(Arc::clone(&slot.value))
    }

    /// Unconditional insert, returning the replaced value
    pub fn put(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let clock = self.tick();
        let mut entries = self.entries.write();
        self.make_room(&mut entries, &key);
        entries
            .insert(key, Slot::new(value, clock))
            .map(|slot| slot.value)
    }

    /// Insert `value` only if the current entry is `expected` (by identity;
    /// `None` means absent)
    pub fn compare_and_put(&self, key: K, expected: Option<&Arc<V>>, value: Arc<V>) -> bool {
        let clock = self.tick();
        let mut entries = self.entries.write();
        if !same(entries.get(&key).map(|slot| &slot.value), expected) {
            return false;
        }
        self.make_room(&mut entries, &key);
        entries.insert(key, Slot::new(value, clock));
        true
    }

    /// Insert unless present; returns whichever value ends up cached
    pub fn put_if_new(&self, key: K, value: Arc<V>) -> Arc<V> {
        let clock = self.tick();
        let mut entries = self.entries.write();
        if let Some(slot) = entries.get(&key) {
            slot.touch(clock);
            return Arc::clone(&slot.value);
        }
        self.make_room(&mut entries, &key);
        entries.insert(key, Slot::new(Arc::clone(&value), clock));
        value
    }

    /// Remove the entry only if it is still `expected`
    pub fn compare_and_remove(&self, key: &K, expected: &Arc<V>) -> bool {
        let mut entries = self.entries.write();
        if !same(entries.get(key).map(|slot| &slot.value), Some(expected)) {
            return false;
        }
        entries.remove(key);
        true
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.write().remove(key).map(|slot| slot.value)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Evict until one more entry fits. Replacing `incoming` needs no room.
    fn make_room(&self, entries: &mut HashMap<K, Slot<V>>, incoming: &K) {
        if entries.contains_key(incoming) {
            return;
        }
        while entries.len() >= self.capacity {
            let Some(victim) = Self::find_lru_entry(entries) else {
                break;
            };
            entries.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn find_lru_entry(entries: &HashMap<K, Slot<V>>) -> Option<K> {
        entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_evict_lru() {
        let cache = LruCache::new(2);
        cache.put(1, Arc::new("a"));
        cache.put(2, Arc::new("b"));

        // Touch 1 so 2 is the oldest
        assert_eq!(*cache.get(&1).unwrap(), "a");
        cache.put(3, Arc::new("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&1).is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = LruCache::new(2);
        cache.put(1, Arc::new(1));
        cache.put(2, Arc::new(2));
        let old = cache.put(2, Arc::new(20)).unwrap();
        assert_eq!(*old, 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_compare_and_put_uses_identity() {
        let cache = LruCache::new(8);
        let first = Arc::new(String::from("v"));
        assert!(cache.compare_and_put("k", None, Arc::clone(&first)));
        assert!(!cache.compare_and_put("k", None, Arc::new(String::from("x"))));

        // Equal contents but a different allocation is not a match
        let lookalike = Arc::new(String::from("v"));
        assert!(!cache.compare_and_put("k", Some(&lookalike), Arc::new(String::from("y"))));

        assert!(cache.compare_and_put("k", Some(&first), Arc::new(String::from("z"))));
        assert_eq!(cache.get(&"k").unwrap().as_str(), "z");
    }

    #[test]
    fn test_put_if_new() {
        let cache = LruCache::new(8);
        let first = cache.put_if_new("k", Arc::new(1));
        let second = cache.put_if_new("k", Arc::new(2));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
    }

    #[test]
    fn test_compare_and_remove() {
        let cache = LruCache::new(8);
        let value = Arc::new(1);
        cache.put("k", Arc::clone(&value));
        assert!(!cache.compare_and_remove(&"k", &Arc::new(1)));
        assert!(cache.compare_and_remove(&"k", &value));
        assert!(cache.is_empty());
        assert!(!cache.compare_and_remove(&"k", &value));
    }
}
