//! Backend over a local directory tree.
//!
//! The tree is walked once at construction; entries created afterwards are
//! not visible. File content is read lazily through one block cache per file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rangefs_cache::{BlockCache, BufferRegistry, ContentKey, FileRangeSource, RangeSource};
use rangefs_common::{normalize_virtual_path, PathError};
use walkdir::WalkDir;

use crate::backend::ReadOnlyBackend;
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

#[derive(Debug)]
struct LocalEntry {
    kind: EntryKind,
    size: u64,
    real_path: PathBuf,
    /// Names of direct children, sorted. Empty for files.
    children: Vec<String>,
}

/// Read-only view of a local directory.
pub struct LocalDirBackend {
    root: PathBuf,
    /// Keyed by normalized virtual path; the root is `/`.
    entries: BTreeMap<String, LocalEntry>,
    registry: BufferRegistry,
}

impl LocalDirBackend {
    /// Walk `root` and build the backend.
    ///
    /// Entries that are neither regular files nor directories, have
    /// non-UTF-8 names, or cannot be inspected are skipped with a warning.
    /// Symlinks are followed.
    ///
    /// # Arguments
    /// * `root` - Directory to expose
    /// * `registry` - Registry the file caches are created in
    ///
    /// # Errors
    /// Returns `BackendError::RootMissing` if `root` does not exist or is not
    /// a directory.
    pub fn new(root: impl Into<PathBuf>, registry: BufferRegistry) -> Result<Self, BackendError> {
        let root: PathBuf = root.into();
        if !root.is_dir() {
            return Err(BackendError::RootMissing {
                root: root.display().to_string(),
            });
        }

        let mut entries: BTreeMap<String, LocalEntry> = BTreeMap::new();
        for entry in WalkDir::new(&root).follow_links(true).into_iter() {
            let entry: walkdir::DirEntry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            let path: &Path = entry.path();
            let metadata: std::fs::Metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let kind: EntryKind = if metadata.is_dir() {
                EntryKind::Dir
            } else if metadata.is_file() {
                EntryKind::File
            } else {
                log::warn!("Skipping special file {}", path.display());
                continue;
            };

            let virtual_path: String = match virtual_path_for(path, &root) {
                Ok(virtual_path) => virtual_path,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            entries.insert(
                virtual_path,
                LocalEntry {
                    kind,
                    size: metadata.len(),
                    real_path: path.to_path_buf(),
                    children: Vec::new(),
                },
            );
        }

        link_children(&mut entries);
        log::info!(
            "Loaded {} entries from {}",
            entries.len().saturating_sub(1),
            root.display()
        );

        Ok(Self {
            root,
            entries,
            registry,
        })
    }

    /// Directory this backend exposes.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lookup(&self, path: &str) -> Result<&LocalEntry, BackendError> {
        let normalized: String = normalize_virtual_path(path)?;
        self.entries
            .get(&normalized)
            .ok_or_else(|| BackendError::not_found(path))
    }

    fn cache_for(&self, entry: &LocalEntry) -> BlockCache {
        let key: ContentKey = ContentKey::for_path(&entry.real_path);
        self.registry
            .get_or_create_with(&key, Some(entry.size), || -> Arc<dyn RangeSource> {
                Arc::new(FileRangeSource::new(entry.real_path.clone()))
            })
    }
}

/// Virtual path of `path` relative to `root`.
fn virtual_path_for(path: &Path, root: &Path) -> Result<String, PathError> {
    let relative: &Path = path
        .strip_prefix(root)
        .map_err(|_| PathError::PathOutsideRoot {
            path: path.display().to_string(),
            root: root.display().to_string(),
        })?;

    let mut segments: Vec<&str> = Vec::new();
    for component in relative.components() {
        let segment: &str = component.as_os_str().to_str().ok_or_else(|| {
            PathError::InvalidPath {
                path: path.display().to_string(),
            }
        })?;
        segments.push(segment);
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Fill each directory's `children` from the flat entry map.
fn link_children(entries: &mut BTreeMap<String, LocalEntry>) {
    let mut links: Vec<(String, String)> = Vec::new();
    for path in entries.keys() {
        if path == "/" {
            continue;
        }
        if let Some((parent, name)) = path.rsplit_once('/') {
            let parent: &str = if parent.is_empty() { "/" } else { parent };
            links.push((parent.to_string(), name.to_string()));
        }
    }

    for (parent, name) in links {
        if let Some(entry) = entries.get_mut(&parent) {
            entry.children.push(name);
        }
    }
    for entry in entries.values_mut() {
        entry.children.sort();
    }
}

#[async_trait]
impl ReadOnlyBackend for LocalDirBackend {
    fn has(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.lookup(path), Ok(entry) if entry.kind == EntryKind::Dir)
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        match self.lookup(path) {
            Ok(entry) if entry.kind == EntryKind::Dir => Ok(entry.children.clone()),
            _ => Err(BackendError::denied(path)),
        }
    }

    fn size(&self, path: &str) -> Result<u64, BackendError> {
        Ok(self.lookup(path)?.size)
    }

    async fn read(&self, path: &str, length: u64, offset: u64) -> Result<Vec<u8>, BackendError> {
        let entry: &LocalEntry = self.lookup(path)?;
        if entry.kind == EntryKind::Dir {
            return Err(BackendError::denied(path));
        }
        let cache: BlockCache = self.cache_for(entry);
        Ok(cache.read(offset, length).await?)
    }

    fn registry(&self) -> &BufferRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for LocalDirBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirBackend")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .field("registry", &self.registry)
            .finish()
    }
}
