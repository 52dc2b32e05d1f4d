//! A size bounded, in-memory cache of compact filters keyed by block hash.
//!
//! The budget is expressed in bytes of serialized filter, not in number of entries. Filters
//! vary a lot in size (a few bytes for empty blocks, tens of kilobytes for busy ones), so
//! counting entries would make memory usage unpredictable. Entries are evicted in
//! least-recently-used order, where both insertions and hits count as a use.
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use bitcoin::bip158::BlockFilter;
use bitcoin::BlockHash;
use log::debug;
use lru::LruCache;

/// Default budget, 32 MiB of filters
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCacheError {
    /// The filter alone is bigger than the whole budget, it was not stored
    TooLarge { size: usize, budget: usize },
}

impl Display for FilterCacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterCacheError::TooLarge { size, budget } => write!(
                f,
                "filter of {size} bytes doesn't fit in a cache of {budget} bytes"
            ),
        }
    }
}

impl std::error::Error for FilterCacheError {}

#[derive(Debug)]
struct CacheEntry {
    filter: Arc<BlockFilter>,
    /// Computed once, when the entry is inserted
    size: usize,
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<BlockHash, CacheEntry>,
    /// Always equal to the sum of `size` over `entries`
    total_size: usize,
}

#[derive(Debug)]
pub struct FilterCache {
    inner: Mutex<Inner>,
    budget: usize,
}

impl Default for FilterCache {
    fn default() -> Self {
        FilterCache::new(DEFAULT_CACHE_SIZE)
    }
}

impl FilterCache {
    /// Creates an empty cache that will hold at most `budget` bytes of filters
    pub fn new(budget: usize) -> Self {
        FilterCache {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_size: 0,
            }),
            budget,
        }
    }

    // Nothing inside the critical sections can panic, so a poisoned lock still guards a
    // consistent structure.
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached filter for this block, marking it as the most recently used
    pub fn get(&self, block_hash: &BlockHash) -> Option<Arc<BlockFilter>> {
        self.inner()
            .entries
            .get(block_hash)
            .map(|entry| entry.filter.clone())
    }

    /// Like [FilterCache::get], but doesn't touch the eviction order
    pub fn peek(&self, block_hash: &BlockHash) -> Option<Arc<BlockFilter>> {
        self.inner()
            .entries
            .peek(block_hash)
            .map(|entry| entry.filter.clone())
    }

    pub fn contains(&self, block_hash: &BlockHash) -> bool {
        self.inner().entries.contains(block_hash)
    }

    /// Inserts a filter, evicting the least recently used entries until it fits.
    ///
    /// Returns how many entries were evicted to make room. If the filter is bigger than the
    /// whole budget the cache is left untouched, including any previous entry for this block.
    pub fn put(&self, block_hash: BlockHash, filter: BlockFilter) -> Result<usize, FilterCacheError> {
        let size = filter.content.len();
        if size > self.budget {
            return Err(FilterCacheError::TooLarge {
                size,
                budget: self.budget,
            });
        }

        let mut inner = self.inner();
        // A re-inserted block is a brand new entry, with its own size
        if let Some(old) = inner.entries.pop(&block_hash) {
            inner.total_size -= old.size;
        }

        let mut evicted = 0;
        while inner.total_size + size > self.budget {
            let Some((evicted_hash, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_size -= entry.size;
            evicted += 1;
            debug!("evicted filter for block {evicted_hash} ({} bytes)", entry.size);
        }

        inner.entries.push(
            block_hash,
            CacheEntry {
                filter: Arc::new(filter),
                size,
            },
        );
        inner.total_size += size;

        Ok(evicted)
    }

    /// Drops the filter for this block, if we have it
    pub fn remove(&self, block_hash: &BlockHash) -> Option<Arc<BlockFilter>> {
        let mut inner = self.inner();
        let entry = inner.entries.pop(block_hash)?;
        inner.total_size -= entry.size;

        Some(entry.filter)
    }

    /// How many bytes of filters we are currently holding
    pub fn total_size(&self) -> usize {
        self.inner().total_size
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recomputes the total from the entries themselves. Used by tests to check that the
    /// running total never drifts.
    pub fn recompute_size(&self) -> usize {
        self.inner()
            .entries
            .iter()
            .map(|(_, entry)| entry.size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bitcoin::bip158::BlockFilter;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use canopy_common::assert_err;
    use canopy_common::assert_ok;

    use super::FilterCache;
    use super::FilterCacheError;

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    fn filter(size: usize) -> BlockFilter {
        BlockFilter::new(&vec![0xab; size])
    }

    #[test]
    fn test_get_put_remove() {
        let cache = FilterCache::new(100);
        assert!(cache.is_empty());
        assert!(cache.get(&hash(1)).is_none());

        assert_ok!(cache.put(hash(1), filter(10)));
        assert_ok!(cache.put(hash(2), filter(20)));
        assert_eq!(cache.total_size(), 30);
        assert_eq!(cache.get(&hash(1)).unwrap().content.len(), 10);

        assert!(cache.remove(&hash(1)).is_some());
        assert_eq!(cache.total_size(), 20);
        assert_eq!(cache.len(), 1);

        // removing twice is a no-op
        assert!(cache.remove(&hash(1)).is_none());
        assert_eq!(cache.total_size(), 20);
    }

    #[test]
    fn test_evicts_least_recently_used_first() {
        let cache = FilterCache::new(30);
        cache.put(hash(1), filter(10)).unwrap();
        cache.put(hash(2), filter(10)).unwrap();
        cache.put(hash(3), filter(10)).unwrap();

        // 1 is now the most recently used, 2 is the oldest
        assert!(cache.get(&hash(1)).is_some());

        let evicted = cache.put(hash(4), filter(15)).unwrap();
        assert_eq!(evicted, 2);
        assert!(!cache.contains(&hash(2)));
        assert!(!cache.contains(&hash(3)));
        assert!(cache.contains(&hash(1)));
        assert!(cache.contains(&hash(4)));
        assert_eq!(cache.total_size(), 25);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let cache = FilterCache::new(20);
        cache.put(hash(1), filter(10)).unwrap();
        cache.put(hash(2), filter(10)).unwrap();

        assert!(cache.peek(&hash(1)).is_some());
        cache.put(hash(3), filter(10)).unwrap();

        assert!(!cache.contains(&hash(1)));
        assert!(cache.contains(&hash(2)));
    }

    #[test]
    fn test_too_large_leaves_cache_unchanged() {
        let cache = FilterCache::new(50);
        cache.put(hash(1), filter(40)).unwrap();

        let res = cache.put(hash(1), filter(51));
        assert_eq!(
            res,
            Err(FilterCacheError::TooLarge {
                size: 51,
                budget: 50
            })
        );
        assert_err!(cache.put(hash(2), filter(1000)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 40);
        assert_eq!(cache.get(&hash(1)).unwrap().content.len(), 40);
    }

    #[test]
    fn test_reinsert_replaces_size() {
        let cache = FilterCache::new(100);
        cache.put(hash(1), filter(60)).unwrap();
        cache.put(hash(1), filter(5)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 5);

        // the old size must not count against the new entry
        assert_eq!(cache.put(hash(1), filter(100)).unwrap(), 0);
        assert_eq!(cache.total_size(), 100);
    }

    #[test]
    fn test_exact_budget_fits() {
        let cache = FilterCache::new(64);
        assert_eq!(cache.put(hash(1), filter(64)).unwrap(), 0);
        assert_eq!(cache.total_size(), 64);
        assert_eq!(cache.put(hash(2), filter(1)).unwrap(), 1);
        assert_eq!(cache.total_size(), 1);
    }

    #[test]
    fn test_budget_invariant_under_random_operations() {
        let cache = FilterCache::new(1_000);
        for i in 0..2_000u32 {
            let key = hash((i % 37) as u8);
            match rand::random::<u8>() % 3 {
                0 => {
                    cache.remove(&key);
                }
                _ => {
                    let _ = cache.put(key, filter(rand::random::<usize>() % 1_200));
                }
            }
            assert!(cache.total_size() <= cache.budget());
            assert_eq!(cache.total_size(), cache.recompute_size());
        }
    }

    #[test]
    fn test_concurrent_access_keeps_total_consistent() {
        let cache = Arc::new(FilterCache::new(4_096));
        let workers: Vec<_> = (0..8u8)
            .map(|worker| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = hash(worker.wrapping_mul(31).wrapping_add((i % 16) as u8));
                        match i % 4 {
                            0 => {
                                cache.remove(&key);
                            }
                            1 => {
                                cache.get(&key);
                            }
                            _ => {
                                let _ = cache.put(key, filter((i as usize * 7) % 700));
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(cache.total_size() <= cache.budget());
        assert_eq!(cache.total_size(), cache.recompute_size());
    }
}
