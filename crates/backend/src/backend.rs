//! The backend interface consumed by the filesystem layer.

use async_trait::async_trait;
use rangefs_cache::BufferRegistry;

use crate::error::BackendError;
use crate::image::ImageBackend;
use crate::local::LocalDirBackend;
use crate::static_backend::StaticBackend;

/// Read-only view of a directory tree.
///
/// Paths are virtual: `/`-separated, absolute or relative to the backend root.
#[async_trait]
pub trait ReadOnlyBackend: Send + Sync {
    /// Whether `path` names a file or directory.
    fn has(&self, path: &str) -> bool;

    /// Whether `path` names a directory.
    fn is_dir(&self, path: &str) -> bool;

    /// Names of the entries directly under the directory `path`.
    ///
    /// # Errors
    /// Returns `BackendError::PermissionDenied` if `path` is not a directory.
    fn list(&self, path: &str) -> Result<Vec<String>, BackendError>;

    /// Size in bytes of the entry at `path`.
    ///
    /// # Errors
    /// Returns `BackendError::NotFound` if `path` does not exist.
    fn size(&self, path: &str) -> Result<u64, BackendError>;

    /// Read up to `length` bytes of the file at `path`, starting at `offset`.
    ///
    /// # Arguments
    /// * `path` - Virtual file path
    /// * `length` - Maximum number of bytes to return
    /// * `offset` - Byte offset into the file
    ///
    /// # Returns
    /// The bytes read. Shorter than `length` only at end of file.
    ///
    /// # Errors
    /// Returns `BackendError::PermissionDenied` for directories,
    /// `BackendError::NotFound` for missing paths, and `BackendError::Cache`
    /// when the block cache cannot produce the data.
    async fn read(&self, path: &str, length: u64, offset: u64) -> Result<Vec<u8>, BackendError>;

    /// Registry holding the block caches for this backend's content.
    fn registry(&self) -> &BufferRegistry;
}

/// Backend selected at startup.
#[derive(Debug)]
pub enum Backend {
    /// Flat in-memory fixture.
    Static(StaticBackend),
    /// Local directory tree.
    LocalDir(LocalDirBackend),
    /// Filesystem image over a content store.
    Image(ImageBackend),
}

impl Backend {
    fn inner(&self) -> &dyn ReadOnlyBackend {
        match self {
            Backend::Static(backend) => backend,
            Backend::LocalDir(backend) => backend,
            Backend::Image(backend) => backend,
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Static(_) => "static",
            Backend::LocalDir(_) => "local",
            Backend::Image(_) => "image",
        }
    }
}

#[async_trait]
impl ReadOnlyBackend for Backend {
    fn has(&self, path: &str) -> bool {
        self.inner().has(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.inner().is_dir(path)
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.inner().list(path)
    }

    fn size(&self, path: &str) -> Result<u64, BackendError> {
        self.inner().size(path)
    }

    async fn read(&self, path: &str, length: u64, offset: u64) -> Result<Vec<u8>, BackendError> {
        self.inner().read(path, length, offset).await
    }

    fn registry(&self) -> &BufferRegistry {
        self.inner().registry()
    }
}

impl From<StaticBackend> for Backend {
    fn from(backend: StaticBackend) -> Self {
        Backend::Static(backend)
    }
}

impl From<LocalDirBackend> for Backend {
    fn from(backend: LocalDirBackend) -> Self {
        Backend::LocalDir(backend)
    }
}

impl From<ImageBackend> for Backend {
    fn from(backend: ImageBackend) -> Self {
        Backend::Image(backend)
    }
}
