//! An in-memory filter store. Being in-memory means it's volatile, everything is lost once
//! it's dropped. It's not meant for production, it exists for tests and demos that need a
//! [FilterStore] without a real block database behind it.
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use bitcoin::bip158::BlockFilter;
use bitcoin::BlockHash;

use crate::FilterStore;
use crate::FilterStoreError;

#[derive(Debug, Default)]
struct Inner {
    /// Block hashes indexed by height
    chain: Vec<BlockHash>,
    heights: HashMap<BlockHash, u32>,
    filters: HashMap<BlockHash, BlockFilter>,
    /// How many times `load_filter` was called, handy to check a cache in front of us
    loads: u64,
}

#[derive(Debug, Default)]
pub struct MemoryFilterStore {
    inner: RwLock<Inner>,
}

type Result<T> = std::result::Result<T, FilterStoreError>;

impl MemoryFilterStore {
    fn get_inner(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| FilterStoreError::PoisonedLock)
    }

    fn get_inner_mut(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| FilterStoreError::PoisonedLock)
    }

    pub fn new() -> MemoryFilterStore {
        MemoryFilterStore::default()
    }

    /// Appends a block on top of our chain, with its filter
    pub fn push_block(&self, block_hash: BlockHash, filter: BlockFilter) -> Result<u32> {
        let mut inner = self.get_inner_mut()?;
        let height = inner.chain.len() as u32;
        inner.chain.push(block_hash);
        inner.heights.insert(block_hash, height);
        inner.filters.insert(block_hash, filter);

        Ok(height)
    }

    pub fn height(&self) -> Result<Option<u32>> {
        let inner = self.get_inner()?;
        Ok(inner.chain.len().checked_sub(1).map(|h| h as u32))
    }

    pub fn load_count(&self) -> Result<u64> {
        Ok(self.get_inner()?.loads)
    }
}

impl FilterStore for MemoryFilterStore {
    fn load_filter(&self, block_hash: &BlockHash) -> Result<Option<BlockFilter>> {
        let mut inner = self.get_inner_mut()?;
        inner.loads += 1;

        Ok(inner.filters.get(block_hash).cloned())
    }

    fn block_height(&self, block_hash: &BlockHash) -> Result<Option<u32>> {
        Ok(self.get_inner()?.heights.get(block_hash).copied())
    }

    fn block_hashes(&self, start_height: u32, stop_hash: &BlockHash) -> Result<Vec<BlockHash>> {
        let inner = self.get_inner()?;
        let Some(&stop_height) = inner.heights.get(stop_hash) else {
            return Ok(Vec::new());
        };

        if stop_height < start_height {
            return Ok(Vec::new());
        }

        Ok(inner.chain[start_height as usize..=stop_height as usize].to_vec())
    }
}
