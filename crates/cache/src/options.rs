//! Configuration for a block cache.
//!
//! Every [`BlockCache`](crate::BlockCache) is constructed from one of these.
//! A [`BufferRegistry`](crate::BufferRegistry) holds a template config and
//! stamps each content stream's known size into it when creating a cache.
//!
//! # Example
//!
//! ```ignore
//! let config = BlockCacheConfig::default()
//!     .with_block_size(4 * 1024 * 1024)
//!     .with_prefetch_blocks(0) // backing store serializes requests
//!     .with_wait_timeout(Duration::from_secs(2));
//! ```

use std::time::Duration;

use rangefs_common::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_LIMIT, DEFAULT_PREFETCH_BLOCKS, DEFAULT_PREFETCH_STAGGER,
    DEFAULT_WAIT_TIMEOUT,
};

use crate::error::CacheError;

/// Tuning parameters for a single block cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCacheConfig {
    /// Bytes per block.
    pub block_size: u64,
    /// Maximum number of resident blocks before eviction kicks in.
    pub cache_limit: usize,
    /// Blocks to prefetch ahead of each read. 0 disables prefetch.
    pub prefetch_blocks: u32,
    /// Total stream length, if known upfront.
    pub known_size: Option<u64>,
    /// Bound on waiting for a block another fetch is already bringing in.
    pub wait_timeout: Duration,
    /// Delay added per prefetch slot, so slot `n` starts `n * stagger` late.
    pub prefetch_stagger: Duration,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_limit: DEFAULT_CACHE_LIMIT,
            prefetch_blocks: DEFAULT_PREFETCH_BLOCKS,
            known_size: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            prefetch_stagger: DEFAULT_PREFETCH_STAGGER,
        }
    }
}

impl BlockCacheConfig {
    /// Set the block size in bytes.
    ///
    /// # Arguments
    /// * `block_size` - Bytes per block (must be non-zero)
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the maximum number of resident blocks.
    ///
    /// # Arguments
    /// * `cache_limit` - Resident block limit (must be at least 1)
    pub fn with_cache_limit(mut self, cache_limit: usize) -> Self {
        self.cache_limit = cache_limit;
        self
    }

    /// Set the prefetch depth.
    ///
    /// # Arguments
    /// * `prefetch_blocks` - Blocks fetched ahead per read, 0 to disable
    pub fn with_prefetch_blocks(mut self, prefetch_blocks: u32) -> Self {
        self.prefetch_blocks = prefetch_blocks;
        self
    }

    /// Set the total stream length.
    ///
    /// # Arguments
    /// * `known_size` - Stream length, or None to discover it from a short read
    pub fn with_known_size(mut self, known_size: Option<u64>) -> Self {
        self.known_size = known_size;
        self
    }

    /// Set the in-flight wait bound.
    ///
    /// # Arguments
    /// * `wait_timeout` - How long a reader waits for an in-flight block
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Set the per-slot prefetch delay.
    ///
    /// # Arguments
    /// * `prefetch_stagger` - Delay multiplied by the prefetch slot index
    pub fn with_prefetch_stagger(mut self, prefetch_stagger: Duration) -> Self {
        self.prefetch_stagger = prefetch_stagger;
        self
    }

    /// Whether background prefetch is enabled.
    pub fn prefetch_enabled(&self) -> bool {
        self.prefetch_blocks > 0
    }

    /// Check the configuration for values the cache cannot work with.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidConfig` for a zero block size or a zero
    /// cache limit.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.block_size == 0 {
            return Err(CacheError::InvalidConfig {
                message: "block_size must be non-zero".to_string(),
            });
        }
        if self.cache_limit == 0 {
            return Err(CacheError::InvalidConfig {
                message: "cache_limit must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
