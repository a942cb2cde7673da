//! The client-side lookup cache (spec.md §4.7): one entry per
//! intermediate directory component resolved during path resolution,
//! good until its lease expires.

use crate::time::now_micros;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Copy)]
pub struct LookupCacheEntry {
    pub inode: i64,
    pub uid: i32,
    pub gid: i32,
    pub perm: u32,
    pub zeroth_server: i16,
    pub lease_due: i64,
}

impl LookupCacheEntry {
    pub fn is_fresh(&self) -> bool {
        now_micros() < self.lease_due
    }
}

/// Keyed by `(parent_inode, name)`, per spec.md §4.7 step 2.
pub struct LookupCache {
    inner: Mutex<LruCache<(i64, String), LookupCacheEntry>>,
}

impl LookupCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        LookupCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the cached entry for `(parent, name)` if present, whether
    /// fresh or stale — the caller decides between `Access` (no entry,
    /// or never looked up) and `Renew` (stale entry) per spec.md §4.7.
    pub fn get(&self, parent: i64, name: &str) -> Option<LookupCacheEntry> {
        self.inner.lock().get(&(parent, name.to_string())).copied()
    }

    pub fn insert(&self, parent: i64, name: &str, entry: LookupCacheEntry) {
        self.inner.lock().put((parent, name.to_string()), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lease_due: i64) -> LookupCacheEntry {
        LookupCacheEntry {
            inode: 1,
            uid: 0,
            gid: 0,
            perm: 0o755,
            zeroth_server: 0,
            lease_due,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = LookupCache::new(8);
        assert!(cache.get(0, "a").is_none());
        cache.insert(0, "a", entry(now_micros() + 1_000_000));
        assert!(cache.get(0, "a").is_some());
    }

    #[test]
    fn freshness_reflects_lease_due() {
        let fresh = entry(now_micros() + 1_000_000);
        let stale = entry(now_micros() - 1);
        assert!(fresh.is_fresh());
        assert!(!stale.is_fresh());
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache = LookupCache::new(1);
        cache.insert(0, "a", entry(now_micros() + 1_000_000));
        cache.insert(0, "b", entry(now_micros() + 1_000_000));
        assert!(cache.get(0, "a").is_none());
        assert!(cache.get(0, "b").is_some());
    }
}
