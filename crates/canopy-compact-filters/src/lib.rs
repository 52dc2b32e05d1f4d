// SPDX-License-Identifier: MIT

//! Compact block filters as seen by the p2p layer.
//!
//! Filters live in some block/filter store owned by the rest of the node. Serving every
//! `getcfilters` request straight from that store would re-read the same filters over and
//! over while peers sync, so this crate puts a byte-budgeted [FilterCache] in front of it.
//! [NetworkFilters] glues both together as a read-through layer: look in the cache, fall
//! back to the store on a miss, remember what the store returned.
use core::fmt::Debug;
use std::fmt::Display;

use bitcoin::bip158::BlockFilter;
use bitcoin::BlockHash;

pub mod filter_cache;
pub mod memory_store;
pub mod network_filters;

pub use filter_cache::FilterCache;
pub use filter_cache::FilterCacheError;
pub use memory_store::MemoryFilterStore;
pub use network_filters::NetworkFilters;

/// A store that knows the compact filter of each block we have
pub trait FilterStore: Send + Sync {
    /// Fetches the filter for a given block, if we have one
    fn load_filter(&self, block_hash: &BlockHash) -> Result<Option<BlockFilter>, FilterStoreError>;

    /// Height of a block in our chain, `None` if we don't know it
    fn block_height(&self, block_hash: &BlockHash) -> Result<Option<u32>, FilterStoreError>;

    /// Returns the hashes of all blocks from `start_height` up to and including `stop_hash`,
    /// in chain order. An unknown `stop_hash`, or one below `start_height`, yields an empty
    /// list. Callers should check the range size with [FilterStore::block_height] first, this
    /// materializes the whole range.
    fn block_hashes(
        &self,
        start_height: u32,
        stop_hash: &BlockHash,
    ) -> Result<Vec<BlockHash>, FilterStoreError>;
}

pub enum FilterStoreError {
    /// Lock error
    PoisonedLock,
    /// Whatever went wrong inside the backend
    Backend(String),
}

impl Debug for FilterStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterStoreError::PoisonedLock => write!(f, "Lock poisoned"),
            FilterStoreError::Backend(e) => write!(f, "Filter store error: {e}"),
        }
    }
}

impl Display for FilterStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for FilterStoreError {}
