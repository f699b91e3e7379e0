//! Range sources: the backing stores a block cache reads through.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::SourceError;

/// Capability to read a byte range of one content stream.
///
/// Implementations must return exactly `length` bytes unless the range
/// crosses the end of the stream, in which case they return the available
/// tail (possibly empty). They must never return more than requested, and
/// must answer consistently when asked again at or past a point where they
/// previously came up short.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch `length` bytes starting at `offset`.
    ///
    /// # Arguments
    /// * `offset` - Absolute byte offset into the stream
    /// * `length` - Number of bytes wanted
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError>;
}

#[async_trait]
impl<T> RangeSource for Arc<T>
where
    T: RangeSource + ?Sized,
{
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        (**self).fetch(offset, length).await
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// Range source over bytes held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    /// Create a source serving the given bytes.
    ///
    /// # Arguments
    /// * `data` - Full content of the stream
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }

    /// Total length of the content.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        let total: u64 = self.len();
        let start: u64 = offset.min(total);
        let end: u64 = offset.saturating_add(length).min(total);
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

// ============================================================================
// File Range Source
// ============================================================================

/// Range source reading positioned ranges of a local file.
///
/// The file is reopened on every fetch so concurrent fetches never share a
/// cursor.
#[derive(Debug, Clone)]
pub struct FileRangeSource {
    path: PathBuf,
}

impl FileRangeSource {
    /// Create a source for the file at `path`.
    ///
    /// # Arguments
    /// * `path` - Local file to read from
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeSource for FileRangeSource {
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        let mut file: tokio::fs::File = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer: Vec<u8> = Vec::new();
        file.take(length).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}
