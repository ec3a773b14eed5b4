//! Fixed-size cache pages with per-page transaction state.
//!
//! Pages are shared between the cache (the owning registry) and in-flight
//! cluster operations via `Arc`; an operation holds its references only for
//! the duration of one cluster pass. Each page also carries the transaction
//! state of its pending disk block: the `reserved` flag used for idempotent
//! quota reservation, and the `dirty`/`captured` flags owned jointly with
//! the transaction atom.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Size of one cache page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Transaction state of a page's pending disk block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTxnState {
    /// Quota blocks for this page's cluster pass have been charged
    pub reserved: bool,
    /// Page content differs from what is on disk
    pub dirty: bool,
    /// Page is enlisted in a transaction atom
    pub captured: bool,
    /// Page content is valid (filled from disk or by a writer)
    pub uptodate: bool,
}

/// One fixed-size cache page.
#[derive(Debug)]
pub struct Page {
    object_id: u64,
    index: u64,
    data: RwLock<Vec<u8>>,
    txn: Mutex<PageTxnState>,
}

impl Page {
    fn new(object_id: u64, index: u64) -> Self {
        Self {
            object_id,
            index,
            data: RwLock::new(vec![0u8; PAGE_SIZE]),
            txn: Mutex::new(PageTxnState::default()),
        }
    }

    /// Owning object id.
    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    /// Page index within the object.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Read access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Write access to the page bytes.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Snapshot of the page's transaction state.
    pub fn txn_state(&self) -> PageTxnState {
        *self.txn.lock()
    }

    /// Mutates the page's transaction state under its lock.
    pub fn update_txn<R>(&self, f: impl FnOnce(&mut PageTxnState) -> R) -> R {
        f(&mut self.txn.lock())
    }
}

/// Counters for page cache activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageCacheStats {
    /// Lookups that found an existing page
    pub hits: u64,
    /// Lookups that created or missed a page
    pub misses: u64,
    /// Pages dropped by eviction
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    pages: HashMap<(u64, u64), Arc<Page>>,
    stats: PageCacheStats,
}

/// Registry of cache pages, keyed by `(object id, page index)`.
///
/// The cache retains true ownership of every page; callers get `Arc`
/// references. When a cluster operation needs several pages it must grab
/// them in ascending index order (lock-ordering discipline).
#[derive(Debug, Default)]
pub struct PageCache {
    inner: Mutex<CacheInner>,
}

impl PageCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the page at `(object_id, index)`, creating a zeroed page if
    /// none exists yet.
    pub fn grab(&self, object_id: u64, index: u64) -> Arc<Page> {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get(&(object_id, index)) {
            let page = Arc::clone(page);
            inner.stats.hits += 1;
            return page;
        }
        inner.stats.misses += 1;
        let page = Arc::new(Page::new(object_id, index));
        inner.pages.insert((object_id, index), Arc::clone(&page));
        page
    }

    /// Returns the page at `(object_id, index)` if it is cached.
    pub fn lookup(&self, object_id: u64, index: u64) -> Option<Arc<Page>> {
        let mut inner = self.inner.lock();
        match inner.pages.get(&(object_id, index)) {
            Some(page) => {
                let page = Arc::clone(page);
                inner.stats.hits += 1;
                Some(page)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Drops every cached page of `object_id` with index in `[from, to)`.
    /// Returns the evicted pages so the caller can settle their
    /// transaction state (e.g. release still-reserved quota).
    pub fn evict_range(&self, object_id: u64, from: u64, to: u64) -> Vec<Arc<Page>> {
        let mut inner = self.inner.lock();
        let doomed: Vec<(u64, u64)> = inner
            .pages
            .keys()
            .filter(|(obj, idx)| *obj == object_id && (from..to).contains(idx))
            .copied()
            .collect();
        let mut evicted = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(page) = inner.pages.remove(&key) {
                evicted.push(page);
                inner.stats.evictions += 1;
            }
        }
        if !evicted.is_empty() {
            debug!(object_id, from, to, count = evicted.len(), "pages evicted");
        }
        evicted
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Whether the cache holds no pages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activity counters.
    pub fn stats(&self) -> PageCacheStats {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_creates_zeroed_page() {
        let cache = PageCache::new();
        let page = cache.grab(1, 0);
        assert_eq!(page.read().len(), PAGE_SIZE);
        assert!(page.read().iter().all(|&b| b == 0));
        assert!(!page.txn_state().uptodate);
    }

    #[test]
    fn grab_returns_same_page() {
        let cache = PageCache::new();
        let a = cache.grab(1, 3);
        let b = cache.grab(1, 3);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn hit_counters_track_grab_and_lookup() {
        let cache = PageCache::new();
        let a = cache.grab(1, 0);
        let b = cache.grab(1, 0);
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.lookup(1, 0).expect("page cached");
        assert!(Arc::ptr_eq(&a, &c));
        assert!(cache.lookup(1, 1).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn lookup_does_not_create() {
        let cache = PageCache::new();
        assert!(cache.lookup(1, 0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn pages_are_distinct_per_object() {
        let cache = PageCache::new();
        let a = cache.grab(1, 0);
        let b = cache.grab(2, 0);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn writes_are_visible_through_the_cache() {
        let cache = PageCache::new();
        {
            let page = cache.grab(1, 5);
            page.write()[..4].copy_from_slice(b"test");
            page.update_txn(|t| t.uptodate = true);
        }
        let page = cache.lookup(1, 5).expect("page still cached");
        assert_eq!(&page.read()[..4], b"test");
        assert!(page.txn_state().uptodate);
    }

    #[test]
    fn evict_range_is_object_and_range_scoped() {
        let cache = PageCache::new();
        for idx in 0..4 {
            cache.grab(1, idx);
        }
        cache.grab(2, 1);
        let evicted = cache.evict_range(1, 1, 3);
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.len(), 3);
        assert!(cache.lookup(1, 0).is_some());
        assert!(cache.lookup(1, 1).is_none());
        assert!(cache.lookup(2, 1).is_some());
    }

    #[test]
    fn txn_state_updates_are_isolated_per_page() {
        let cache = PageCache::new();
        let a = cache.grab(1, 0);
        let b = cache.grab(1, 1);
        a.update_txn(|t| t.reserved = true);
        assert!(a.txn_state().reserved);
        assert!(!b.txn_state().reserved);
    }
}
