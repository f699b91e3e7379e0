//! Block-wise prefetching read cache for range-addressable content.
//!
//! Sits between a read-only filesystem's read path and a slow backing store
//! (cloud media, large local files). Scattered small reads are turned into a
//! bounded number of block-sized fetches, upcoming blocks are fetched in the
//! background, and resident memory is bounded by LRU eviction.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: BufferRegistry   (content identity -> BlockCache, created lazily)
//! Layer 2: BlockCache       (block alignment, range composition, prefetch, eviction)
//! Layer 1: RangeSource      (fetch(offset, length) against the backing store)
//! ```

pub mod block_cache;
pub mod error;
pub mod options;
pub mod registry;
pub mod source;

pub use block_cache::{BlockCache, BlockCacheStats};
pub use error::{CacheError, SourceError};
pub use options::BlockCacheConfig;
pub use registry::{BufferRegistry, ContentKey};
pub use source::{FileRangeSource, MemorySource, RangeSource};
