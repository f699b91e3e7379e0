//! Error types for the block cache.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`RangeSource`](crate::RangeSource).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The content behind the source no longer exists.
    #[error("Content not found: {what}")]
    NotFound { what: String },

    /// The source handed back more bytes than were asked for.
    #[error("Source returned {returned} bytes for a {requested} byte request")]
    Overrun { requested: u64, returned: u64 },

    /// Local or remote I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound {
                what: err.to_string(),
            },
            _ => SourceError::Io {
                message: err.to_string(),
            },
        }
    }
}

/// Errors surfaced by [`BlockCache::read`](crate::BlockCache::read).
///
/// Internal invariant violations are not represented here: they panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Negative or overflowing offset/length. Not retryable.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An in-flight block did not arrive within the wait bound.
    #[error("Block {block} still in flight after {waited:?}")]
    CacheTimeout { block: u64, waited: Duration },

    /// The range source failed. Propagated unchanged, never retried here.
    #[error("Source fetch failed at offset {offset} (length {length}): {source}")]
    SourceFetch {
        offset: u64,
        length: u64,
        source: SourceError,
    },

    /// Rejected cache configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl CacheError {
    /// Check if the caller may retry the whole read.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::CacheTimeout { .. } => true,
            CacheError::InvalidArgument { .. } => false,
            CacheError::SourceFetch { .. } => false,
            CacheError::InvalidConfig { .. } => false,
        }
    }
}
