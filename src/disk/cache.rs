//! A small LRU cache of recently served blocks.
//!
//! Used to satisfy peer block requests for data we just finished writing
//! (we're seeding a piece we verified moments ago) without a redundant
//! round trip to the filesystem. Keyed by the exact `(path, offset, len)`
//! triple a request asks for, mirroring how [`super::io`] addresses reads.

use std::{path::PathBuf, sync::Arc};

use lru::LruCache;

/// The default number of blocks kept in the read cache. At the default
/// 16 KiB block length this is 16 MiB of cached data, a reasonable amount
/// to keep recently-written pieces warm for newly-interested peers.
pub(super) const DEFAULT_CAPACITY: usize = 1024;

#[derive(Hash, PartialEq, Eq, Clone)]
struct CacheKey {
    path: PathBuf,
    offset: u64,
    len: u32,
}

/// Caches recently read or written blocks so that repeated reads of the
/// same `(path, offset, len)` don't hit the filesystem.
pub(super) struct ReadCache {
    inner: LruCache<CacheKey, Arc<Vec<u8>>>,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, path: &PathBuf, offset: u64, len: u32) -> Option<Arc<Vec<u8>>> {
        let key = CacheKey {
            path: path.clone(),
            offset,
            len,
        };
        self.inner.get(&key).cloned()
    }

    pub fn insert(&mut self, path: PathBuf, offset: u64, data: Arc<Vec<u8>>) {
        let key = CacheKey {
            path,
            offset,
            len: data.len() as u32,
        };
        self.inner.put(key, data);
    }

    /// Drops every cached entry belonging to `path`, used when a file is
    /// about to be truncated or removed (e.g. torrent removal with
    /// deletion).
    pub fn evict_path(&mut self, path: &PathBuf) {
        let stale: Vec<CacheKey> = self
            .inner
            .iter()
            .filter(|(key, _)| &key.path == path)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.inner.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_returns_a_block() {
        let mut cache = ReadCache::new(4);
        let path = PathBuf::from("/tmp/a");
        cache.insert(path.clone(), 0, Arc::new(vec![1, 2, 3]));
        assert_eq!(cache.get(&path, 0, 3).as_deref(), Some(&vec![1, 2, 3]));
        assert!(cache.get(&path, 0, 4).is_none());
    }

    #[test]
    fn evicts_path_entries_only() {
        let mut cache = ReadCache::new(4);
        let a = PathBuf::from("/tmp/a");
        let b = PathBuf::from("/tmp/b");
        cache.insert(a.clone(), 0, Arc::new(vec![1]));
        cache.insert(b.clone(), 0, Arc::new(vec![2]));
        cache.evict_path(&a);
        assert!(cache.get(&a, 0, 1).is_none());
        assert!(cache.get(&b, 0, 1).is_some());
    }
}
