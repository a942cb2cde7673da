//! The client-side directory-index cache (spec.md §4.7): an LRU of
//! `DirectoryIndex` keyed by `dir_id`, refreshed from `ReadBitmap` on
//! miss and merged in place whenever a redirect hands back a newer DI.

use giga_index::DirectoryIndex;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub struct IndexCache {
    inner: Mutex<LruCache<i64, DirectoryIndex>>,
}

impl IndexCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        IndexCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, dir_id: i64) -> Option<DirectoryIndex> {
        self.inner.lock().get(&dir_id).cloned()
    }

    pub fn insert(&self, di: DirectoryIndex) {
        self.inner.lock().put(di.dir_id(), di);
    }

    /// Merges `incoming` into whatever is cached for its directory (or
    /// installs it fresh on a miss), returning the merged copy.
    pub fn merge(&self, incoming: &DirectoryIndex) -> DirectoryIndex {
        let mut guard = self.inner.lock();
        let merged = match guard.get_mut(&incoming.dir_id()) {
            Some(existing) => {
                existing.update(incoming);
                existing.clone()
            }
            None => incoming.clone(),
        };
        guard.put(incoming.dir_id(), merged.clone());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = IndexCache::new(4);
        assert!(cache.get(1).is_none());
        cache.insert(DirectoryIndex::new(1, 0));
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn merge_is_idempotent() {
        let cache = IndexCache::new(4);
        let mut delta = DirectoryIndex::new(1, 0);
        delta.set_bit(3);
        let once = cache.merge(&delta);
        let twice = cache.merge(&delta);
        assert_eq!(once, twice);
        assert!(twice.bit_is_set(3));
    }
}
