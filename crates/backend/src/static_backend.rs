//! Flat in-memory backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rangefs_cache::{BlockCache, BufferRegistry, ContentKey, MemorySource, RangeSource};
use rangefs_common::{content_id_for_bytes, path_to_keys, DIRECTORY_SIZE};

use crate::backend::ReadOnlyBackend;
use crate::error::BackendError;

struct StaticFile {
    key: ContentKey,
    source: MemorySource,
}

/// Backend serving a fixed set of files from memory.
///
/// The root is the only directory; every file sits directly under it.
pub struct StaticBackend {
    files: BTreeMap<String, StaticFile>,
    registry: BufferRegistry,
}

impl StaticBackend {
    /// Create a backend from `(name, content)` pairs.
    ///
    /// # Arguments
    /// * `files` - File names (no slashes) and their contents
    /// * `registry` - Registry the file caches are created in
    ///
    /// # Errors
    /// Returns `BackendError::Path` if a name is empty or contains a slash.
    pub fn new<I, N>(files: I, registry: BufferRegistry) -> Result<Self, BackendError>
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: Into<String>,
    {
        let mut entries: BTreeMap<String, StaticFile> = BTreeMap::new();
        for (name, data) in files {
            let name: String = name.into();
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(rangefs_common::PathError::InvalidPath { path: name }.into());
            }
            let key: ContentKey = ContentKey::new(content_id_for_bytes(&data));
            entries.insert(
                name,
                StaticFile {
                    key,
                    source: MemorySource::new(data),
                },
            );
        }

        Ok(Self {
            files: entries,
            registry,
        })
    }

    /// Resolve `path` to a file name; `None` for the root.
    fn lookup(&self, path: &str) -> Result<Option<&StaticFile>, BackendError> {
        let keys: Vec<&str> = path_to_keys(path);
        match keys.as_slice() {
            [] => Ok(None),
            [name] => self
                .files
                .get(*name)
                .map(Some)
                .ok_or_else(|| BackendError::not_found(path)),
            _ => Err(BackendError::not_found(path)),
        }
    }

    fn cache_for(&self, file: &StaticFile) -> BlockCache {
        let known_size: Option<u64> = Some(file.source.len());
        self.registry
            .get_or_create_with(&file.key, known_size, || -> Arc<dyn RangeSource> {
                Arc::new(file.source.clone())
            })
    }
}

#[async_trait]
impl ReadOnlyBackend for StaticBackend {
    fn has(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    fn is_dir(&self, path: &str) -> bool {
        path_to_keys(path).is_empty()
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        if !self.is_dir(path) {
            return Err(BackendError::denied(path));
        }
        Ok(self.files.keys().cloned().collect())
    }

    fn size(&self, path: &str) -> Result<u64, BackendError> {
        match self.lookup(path)? {
            None => Ok(DIRECTORY_SIZE),
            Some(file) => Ok(file.source.len()),
        }
    }

    async fn read(&self, path: &str, length: u64, offset: u64) -> Result<Vec<u8>, BackendError> {
        let file: &StaticFile = self
            .lookup(path)?
            .ok_or_else(|| BackendError::denied(path))?;
        let cache: BlockCache = self.cache_for(file);
        Ok(cache.read(offset, length).await?)
    }

    fn registry(&self) -> &BufferRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for StaticBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticBackend")
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .finish()
    }
}
