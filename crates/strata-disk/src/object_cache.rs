use std::collections::VecDeque;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::{DiskError, Result};

/// Bounded cache of lazily materialised objects.
///
/// The most recently touched keys are tracked in a small ring; entries in the ring are
/// promoted in the LRU map on every lookup so they are the last to be evicted.
pub struct ObjectCache<K: Hash + Eq + Clone, V: Clone> {
    entries: LruCache<K, V>,
    recent: VecDeque<K>,
    recent_len: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> ObjectCache<K, V> {
    pub fn new(capacity: usize, recent_len: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(DiskError::InvalidConfig("object cache capacity must be > 0"))?;
        if recent_len > capacity.get() {
            return Err(DiskError::InvalidConfig(
                "recent ring must not exceed cache capacity",
            ));
        }
        Ok(Self {
            entries: LruCache::new(capacity),
            recent: VecDeque::with_capacity(recent_len),
            recent_len,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.put(key.clone(), value);
        self.touch(&key);
    }

    /// Returns the cached value, materialising it with `load` on a miss.
    pub fn get_or_try_insert_with<F>(&mut self, key: &K, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let value = load()?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.recent.retain(|k| k != key);
        self.entries.pop(key)
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.entries.clear();
    }

    fn touch(&mut self, key: &K) {
        if self.recent_len == 0 {
            return;
        }
        self.recent.retain(|k| k != key);
        if self.recent.len() == self.recent_len {
            self.recent.pop_back();
        }
        self.recent.push_front(key.clone());
        for k in self.recent.iter().rev() {
            self.entries.promote(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = ObjectCache::new(2, 1).unwrap();
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn loader_runs_only_on_miss() {
        let mut cache = ObjectCache::new(4, 2).unwrap();
        let mut loads = 0;
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert_with(&7u32, || {
                    loads += 1;
                    Ok("seven")
                })
                .unwrap();
            assert_eq!(v, "seven");
        }
        assert_eq!(loads, 1);
    }

    #[test]
    fn loader_errors_are_not_cached() {
        let mut cache: ObjectCache<u32, u32> = ObjectCache::new(4, 0).unwrap();
        assert!(cache
            .get_or_try_insert_with(&1, || Err(DiskError::CorruptStructure("bad")))
            .is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(ObjectCache::<u8, u8>::new(0, 0).is_err());
        assert!(ObjectCache::<u8, u8>::new(2, 3).is_err());
    }
}
