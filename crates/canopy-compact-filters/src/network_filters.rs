use std::fmt::Debug;
use std::sync::Arc;

use bitcoin::bip158::BlockFilter;
use bitcoin::BlockHash;
use log::debug;

use crate::FilterCache;
use crate::FilterStore;
use crate::FilterStoreError;

/// Filters as served to the network: a [FilterCache] in front of a [FilterStore].
///
/// The cache is shared, every peer serving filters and the block sync feeding new ones talk
/// to the same instance.
pub struct NetworkFilters {
    store: Arc<dyn FilterStore>,
    cache: Arc<FilterCache>,
}

impl Debug for NetworkFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkFilters")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl NetworkFilters {
    pub fn new(store: Arc<dyn FilterStore>, cache: Arc<FilterCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<FilterCache> {
        &self.cache
    }

    /// Returns the filter for this block, going to the store only if it's not cached.
    ///
    /// A filter too big for the cache is still returned, it just won't be remembered.
    pub fn get_filter(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<Arc<BlockFilter>>, FilterStoreError> {
        if let Some(filter) = self.cache.get(block_hash) {
            return Ok(Some(filter));
        }

        let Some(filter) = self.store.load_filter(block_hash)? else {
            return Ok(None);
        };

        if let Err(e) = self.cache.put(*block_hash, filter.clone()) {
            debug!("not caching filter for {block_hash}: {e}");
        }

        Ok(Some(Arc::new(filter)))
    }

    /// Used by block sync when a new filter is built, so peers asking for it right away
    /// don't hit the store
    pub fn push_filter(&self, block_hash: BlockHash, filter: BlockFilter) {
        if let Err(e) = self.cache.put(block_hash, filter) {
            debug!("not caching filter for {block_hash}: {e}");
        }
    }

    pub fn block_height(&self, block_hash: &BlockHash) -> Result<Option<u32>, FilterStoreError> {
        self.store.block_height(block_hash)
    }

    pub fn block_hashes(
        &self,
        start_height: u32,
        stop_hash: &BlockHash,
    ) -> Result<Vec<BlockHash>, FilterStoreError> {
        self.store.block_hashes(start_height, stop_hash)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::bip158::BlockFilter;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    use super::NetworkFilters;
    use crate::FilterCache;
    use crate::MemoryFilterStore;

    fn setup(budget: usize, sizes: &[usize]) -> (Arc<MemoryFilterStore>, NetworkFilters) {
        let store = Arc::new(MemoryFilterStore::new());
        for (i, size) in sizes.iter().enumerate() {
            store
                .push_block(
                    BlockHash::from_byte_array([i as u8 + 1; 32]),
                    BlockFilter::new(&vec![7; *size]),
                )
                .unwrap();
        }
        let filters = NetworkFilters::new(store.clone(), Arc::new(FilterCache::new(budget)));

        (store, filters)
    }

    #[test]
    fn test_read_through() {
        let (store, filters) = setup(1_000, &[10, 20]);
        let hash = BlockHash::from_byte_array([1; 32]);

        let first = filters.get_filter(&hash).unwrap().unwrap();
        let second = filters.get_filter(&hash).unwrap().unwrap();
        assert_eq!(first.content, second.content);

        // the second lookup was a cache hit
        assert_eq!(store.load_count().unwrap(), 1);
        assert!(filters.cache().contains(&hash));
    }

    #[test]
    fn test_too_large_is_still_served() {
        let (store, filters) = setup(5, &[10]);
        let hash = BlockHash::from_byte_array([1; 32]);

        assert_eq!(filters.get_filter(&hash).unwrap().unwrap().content.len(), 10);
        assert_eq!(filters.get_filter(&hash).unwrap().unwrap().content.len(), 10);

        assert_eq!(store.load_count().unwrap(), 2);
        assert!(filters.cache().is_empty());
    }

    #[test]
    fn test_unknown_block() {
        let (_, filters) = setup(100, &[1]);
        assert!(filters
            .get_filter(&BlockHash::all_zeros())
            .unwrap()
            .is_none());
    }
}
