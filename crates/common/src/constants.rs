//! Shared constants used across rangefs crates.

use std::time::Duration;

/// Default size of one cache block in bytes (2MB).
pub const DEFAULT_BLOCK_SIZE: u64 = 2_000_000;

/// Default maximum number of resident blocks per content stream.
pub const DEFAULT_CACHE_LIMIT: usize = 20;

/// Default number of blocks to prefetch ahead of each read.
pub const DEFAULT_PREFETCH_BLOCKS: u32 = 2;

/// Default bound on waiting for an in-flight block (70 x 100ms).
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(7_000);

/// Default delay between successive prefetch launches within one pass.
pub const DEFAULT_PREFETCH_STAGGER: Duration = Duration::from_millis(500);

/// Size reported for directories by flat backends.
pub const DIRECTORY_SIZE: u64 = 96;
