use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::CacheError;

/// A cache of byte objects with a total size limit and least-recently-used eviction.
///
/// All operations take a single internal lock, so they are atomic with respect to each other.
/// The lock is never held across I/O: objects are inserted after they are read and cloned out ([`Bytes`] is reference counted) or copied into a caller buffer on hit.
///
/// Eviction order is strict recency.
/// Every insert and every hit moves an entry to the most-recently-used end, so entries that were never promoted are evicted in insertion order.
#[derive(Debug)]
pub struct BoundedLruCache {
    max_size: u64,
    inner: Mutex<BoundedLruCacheInner>,
}

#[derive(Debug)]
struct BoundedLruCacheInner {
    entries: LruCache<String, Bytes>,
    size: u64,
}

impl BoundedLruCacheInner {
    fn evict(&mut self, max_size: u64) {
        while self.size > max_size {
            let Some((key, object)) = self.entries.pop_lru() else {
                break;
            };
            log::trace!("cache evicted {key} ({} bytes)", object.len());
            self.size -= object.len() as u64;
        }
    }
}

impl BoundedLruCache {
    /// Create a new cache with a capacity in bytes of `max_size`.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            inner: Mutex::new(BoundedLruCacheInner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    /// Return the capacity of the cache in bytes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Return the total size of the cached objects in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Return the number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `object` under `key`, replacing any object already cached under `key`.
    ///
    /// Least-recently-used objects are then evicted until the total size is within the capacity.
    /// An object larger than the capacity is accepted and evicted immediately.
    pub fn insert(&self, key: impl Into<String>, object: Bytes) {
        let key = key.into();
        let size = object.len() as u64;
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.push(key.clone(), object) {
            // `push` returns the replaced entry for an existing key
            if old.0 == key {
                inner.size -= old.1.len() as u64;
            }
        }
        inner.size += size;
        inner.evict(self.max_size);
    }

    /// Copy `buffer.len()` bytes of the object cached under `key` starting at `offset` into `buffer`.
    ///
    /// Returns `false` on a miss, leaving `buffer` untouched.
    /// A hit promotes the entry to most-recently-used.
    ///
    /// # Errors
    /// Returns [`CacheError::OutOfRange`] if the requested range extends beyond the end of the cached object.
    pub fn read(&self, key: &str, buffer: &mut [u8], offset: u64) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        let Some(object) = inner.entries.get(key) else {
            return Ok(false);
        };
        let nbytes = buffer.len() as u64;
        let size = object.len() as u64;
        if offset.checked_add(nbytes).map_or(true, |end| end > size) {
            return Err(CacheError::OutOfRange {
                key: key.to_string(),
                offset,
                nbytes,
                size,
            });
        }
        // offset + nbytes <= size, which is a usize
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        buffer.copy_from_slice(&object[offset..offset + buffer.len()]);
        Ok(true)
    }

    /// Return the object cached under `key`, promoting it to most-recently-used.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Returns true if an object is cached under `key`. Does not change recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Remove and return the object cached under `key`.
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let object = inner.entries.pop(key)?;
        inner.size -= object.len() as u64;
        Some(object)
    }

    /// Remove all objects whose key starts with `prefix`, returning the number removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(object) = inner.entries.pop(key) {
                inner.size -= object.len() as u64;
            }
        }
        keys.len()
    }

    /// Remove all objects.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(size: usize) -> Bytes {
        Bytes::from(vec![0u8; size])
    }

    #[test]
    fn cache_evicts_oldest() {
        let cache = BoundedLruCache::new(100);
        cache.insert("x", object(40));
        cache.insert("y", object(40));
        cache.insert("z", object(40));
        assert!(!cache.contains("x"));
        assert!(cache.contains("y"));
        assert!(cache.contains("z"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 80);
    }

    #[test]
    fn cache_read_promotes() {
        let cache = BoundedLruCache::new(2);
        cache.insert("a", Bytes::from_static(&[1]));
        cache.insert("b", Bytes::from_static(&[2]));
        let mut buffer = [0u8; 1];
        assert!(cache.read("a", &mut buffer, 0).unwrap());
        assert_eq!(buffer, [1]);
        cache.insert("c", Bytes::from_static(&[3]));
        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));

        assert!(cache.get("a").is_some());
        cache.insert("d", Bytes::from_static(&[4]));
        assert!(!cache.contains("c"));
        assert!(cache.contains("a"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn cache_read_miss_and_out_of_range() {
        let cache = BoundedLruCache::new(100);
        cache.insert("a", Bytes::from_static(&[0, 1, 2, 3]));
        let mut buffer = [9u8; 2];
        assert!(!cache.read("missing", &mut buffer, 0).unwrap());
        assert_eq!(buffer, [9, 9]);
        assert!(cache.read("a", &mut buffer, 2).unwrap());
        assert_eq!(buffer, [2, 3]);
        assert!(matches!(
            cache.read("a", &mut buffer, 3),
            Err(CacheError::OutOfRange {
                offset: 3,
                nbytes: 2,
                size: 4,
                ..
            })
        ));
        assert!(cache.read("a", &mut buffer, u64::MAX).is_err());
        assert!(cache.read("a", &mut [], 4).unwrap());
    }

    #[test]
    fn cache_oversized_object() {
        let cache = BoundedLruCache::new(10);
        cache.insert("a", object(5));
        cache.insert("big", object(11));
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn cache_overwrite() {
        let cache = BoundedLruCache::new(10);
        cache.insert("a", object(6));
        cache.insert("b", object(2));
        cache.insert("a", object(3));
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().len(), 3);
        // "b" is now the least recently used
        cache.insert("c", object(6));
        assert!(!cache.contains("b"));
        assert_eq!(cache.size(), 9);
    }

    #[test]
    fn cache_size_invariant() {
        let cache = BoundedLruCache::new(64);
        for i in 0..200usize {
            let size = (i * 7) % 23;
            cache.insert(format!("{}", i % 17), object(size));
            assert!(cache.size() <= cache.max_size());
            let mut buffer = vec![0u8; size / 2];
            let _ = cache.read(&format!("{}", (i * 3) % 17), &mut buffer, 0);
            if i % 11 == 0 {
                cache.remove(&format!("{}", i % 5));
            }
            assert!(cache.size() <= cache.max_size());
        }
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn cache_remove_prefix() {
        let cache = BoundedLruCache::new(100);
        cache.insert("mem://a/__fragments/f1/0", object(4));
        cache.insert("mem://a/__fragments/f1/1", object(4));
        cache.insert("mem://a/__fragments/f2/0", object(4));
        assert_eq!(cache.remove_prefix("mem://a/__fragments/f1/"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4);
    }
}
