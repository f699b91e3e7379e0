//! Filesystem images over a content-addressed store.
//!
//! An image is a JSON tree. A file is an object of the form
//! `{"file": true, "hash": "xxh128:...", "size": 123}`; every other object is
//! a directory whose keys are the entry names:
//!
//! ```json
//! {
//!     "readme.txt": {"file": true, "hash": "xxh128:9c0e...", "size": 42},
//!     "media": {
//!         "clip.mov": {"file": true, "hash": "xxh128:51aa...", "size": 73400320}
//!     }
//! }
//! ```
//!
//! Content is fetched by hash from a [`ContentStore`]. Files sharing a hash
//! share one block cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rangefs_cache::{
    BlockCache, BufferRegistry, ContentKey, FileRangeSource, RangeSource, SourceError,
};
use rangefs_common::{content_id_for_file, path_to_keys};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::backend::ReadOnlyBackend;
use crate::error::BackendError;

/// Chunk size used when loading an image from a content store.
const IMAGE_READ_CHUNK: u64 = 1024 * 1024;

// ============================================================================
// Image tree
// ============================================================================

/// A file entry in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageFile {
    /// Always `true`; marks the object as a file.
    pub file: bool,
    /// Content identity used to fetch the bytes.
    pub hash: String,
    /// Content length in bytes.
    pub size: u64,
}

impl ImageFile {
    /// Create a file entry.
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            file: true,
            hash: hash.into(),
            size,
        }
    }
}

/// A node of the image tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageNode {
    /// Regular file.
    File(ImageFile),
    /// Directory, keyed by entry name.
    Dir(BTreeMap<String, ImageNode>),
}

impl ImageNode {
    /// Empty directory node.
    pub fn empty_dir() -> Self {
        ImageNode::Dir(BTreeMap::new())
    }

    /// Parse an image from JSON text.
    ///
    /// # Errors
    /// Returns `BackendError::InvalidImage` if the text is not a valid image.
    pub fn from_json(json: &str) -> Result<Self, BackendError> {
        let node: ImageNode =
            serde_json::from_str(json).map_err(|e| BackendError::InvalidImage {
                message: e.to_string(),
            })?;
        node.validate("/")?;
        Ok(node)
    }

    /// Render the image as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns `BackendError::InvalidImage` if serialization fails.
    pub fn to_json(&self) -> Result<String, BackendError> {
        serde_json::to_string_pretty(self).map_err(|e| BackendError::InvalidImage {
            message: e.to_string(),
        })
    }

    /// Whether this node is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, ImageNode::Dir(_))
    }

    /// Follow `path` from this node.
    ///
    /// # Returns
    /// The node at `path`, or `None` if any segment is missing or descends
    /// into a file.
    pub fn find(&self, path: &str) -> Option<&ImageNode> {
        let mut node: &ImageNode = self;
        for key in path_to_keys(path) {
            match node {
                ImageNode::Dir(children) => node = children.get(key)?,
                ImageNode::File(_) => return None,
            }
        }
        Some(node)
    }

    fn validate(&self, at: &str) -> Result<(), BackendError> {
        match self {
            ImageNode::File(file) if !file.file => Err(BackendError::InvalidImage {
                message: format!("{} has \"file\": false alongside file fields", at),
            }),
            ImageNode::File(file) if file.hash.is_empty() => Err(BackendError::InvalidImage {
                message: format!("{} has an empty hash", at),
            }),
            ImageNode::File(_) => Ok(()),
            ImageNode::Dir(children) => {
                for (name, child) in children {
                    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                        return Err(BackendError::InvalidImage {
                            message: format!("invalid entry name {:?} under {}", name, at),
                        });
                    }
                    child.validate(&join_virtual(at, name))?;
                }
                Ok(())
            }
        }
    }
}

fn join_virtual(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

// ============================================================================
// Content stores
// ============================================================================

/// Store that serves content ranges by hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch up to `length` bytes of the content `hash`, starting at `offset`.
    ///
    /// Fewer bytes than requested means the content ends before
    /// `offset + length`.
    ///
    /// # Errors
    /// Returns `SourceError::NotFound` if the store has no such content.
    async fn fetch_range(
        &self,
        hash: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Content store backed by a local directory of blobs named by hash.
#[derive(Debug, Clone)]
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Local path of the blob for `hash`.
    ///
    /// # Errors
    /// Returns `SourceError::NotFound` if `hash` cannot name a blob in the
    /// store directory.
    pub fn blob_path(&self, hash: &str) -> Result<PathBuf, SourceError> {
        if hash.is_empty()
            || hash.contains('/')
            || hash.contains('\\')
            || hash == "."
            || hash == ".."
        {
            return Err(SourceError::NotFound {
                what: format!("invalid content hash {:?}", hash),
            });
        }
        Ok(self.root.join(hash))
    }
}

#[async_trait]
impl ContentStore for DirContentStore {
    async fn fetch_range(
        &self,
        hash: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, SourceError> {
        let path: PathBuf = self.blob_path(hash)?;
        FileRangeSource::new(path).fetch(offset, length).await
    }
}

/// Range source reading one hash from a content store.
pub struct HashRangeSource {
    store: Arc<dyn ContentStore>,
    hash: String,
}

impl HashRangeSource {
    /// Create a source for `hash` in `store`.
    pub fn new(store: Arc<dyn ContentStore>, hash: impl Into<String>) -> Self {
        Self {
            store,
            hash: hash.into(),
        }
    }

    /// Content identity this source reads.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[async_trait]
impl RangeSource for HashRangeSource {
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        self.store.fetch_range(&self.hash, offset, length).await
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Backend serving a filesystem image.
///
/// Directory sizes are reported as 0.
pub struct ImageBackend {
    root: ImageNode,
    store: Arc<dyn ContentStore>,
    registry: BufferRegistry,
}

impl ImageBackend {
    /// Create a backend from an image tree.
    ///
    /// # Arguments
    /// * `root` - Image tree; must be a directory
    /// * `store` - Store holding the file contents
    /// * `registry` - Registry the file caches are created in
    ///
    /// # Errors
    /// Returns `BackendError::InvalidImage` if the tree is malformed.
    pub fn new(
        root: ImageNode,
        store: Arc<dyn ContentStore>,
        registry: BufferRegistry,
    ) -> Result<Self, BackendError> {
        if !root.is_dir() {
            return Err(BackendError::InvalidImage {
                message: "image root must be a directory".to_string(),
            });
        }
        root.validate("/")?;
        Ok(Self {
            root,
            store,
            registry,
        })
    }

    /// Create a backend from image JSON text.
    ///
    /// # Errors
    /// Returns `BackendError::InvalidImage` if the text is not a valid image.
    pub fn from_json(
        json: &str,
        store: Arc<dyn ContentStore>,
        registry: BufferRegistry,
    ) -> Result<Self, BackendError> {
        Self::new(ImageNode::from_json(json)?, store, registry)
    }

    /// Load the image stored under `image_hash` and create a backend from it.
    ///
    /// # Arguments
    /// * `image_hash` - Content identity of the image JSON in `store`
    /// * `store` - Store holding the image and the file contents
    /// * `registry` - Registry the file caches are created in
    ///
    /// # Errors
    /// Returns `BackendError::NotFound` if the store has no such image and
    /// `BackendError::InvalidImage` if it cannot be parsed.
    pub async fn load(
        image_hash: &str,
        store: Arc<dyn ContentStore>,
        registry: BufferRegistry,
    ) -> Result<Self, BackendError> {
        let mut raw: Vec<u8> = Vec::new();
        loop {
            let chunk: Vec<u8> = store
                .fetch_range(image_hash, raw.len() as u64, IMAGE_READ_CHUNK)
                .await
                .map_err(|e| match e {
                    SourceError::NotFound { .. } => BackendError::not_found(image_hash),
                    other => BackendError::Io {
                        path: image_hash.to_string(),
                        message: other.to_string(),
                    },
                })?;
            let done: bool = (chunk.len() as u64) < IMAGE_READ_CHUNK;
            raw.extend_from_slice(&chunk);
            if done {
                break;
            }
        }

        let json: &str = std::str::from_utf8(&raw).map_err(|e| BackendError::InvalidImage {
            message: e.to_string(),
        })?;
        log::info!("Loaded filesystem image {} ({} bytes)", image_hash, raw.len());
        Self::from_json(json, store, registry)
    }

    /// Root of the image tree.
    pub fn image(&self) -> &ImageNode {
        &self.root
    }

    fn cache_for(&self, file: &ImageFile) -> BlockCache {
        let key: ContentKey = ContentKey::new(file.hash.as_str());
        self.registry
            .get_or_create_with(&key, Some(file.size), || -> Arc<dyn RangeSource> {
                Arc::new(HashRangeSource::new(self.store.clone(), file.hash.as_str()))
            })
    }
}

#[async_trait]
impl ReadOnlyBackend for ImageBackend {
    fn has(&self, path: &str) -> bool {
        self.root.find(path).is_some()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.root.find(path).is_some_and(ImageNode::is_dir)
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        match self.root.find(path) {
            Some(ImageNode::Dir(children)) => Ok(children.keys().cloned().collect()),
            _ => Err(BackendError::denied(path)),
        }
    }

    fn size(&self, path: &str) -> Result<u64, BackendError> {
        match self.root.find(path) {
            Some(ImageNode::File(file)) => Ok(file.size),
            Some(ImageNode::Dir(_)) => Ok(0),
            None => Err(BackendError::not_found(path)),
        }
    }

    async fn read(&self, path: &str, length: u64, offset: u64) -> Result<Vec<u8>, BackendError> {
        let file: &ImageFile = match self.root.find(path) {
            Some(ImageNode::File(file)) => file,
            Some(ImageNode::Dir(_)) => return Err(BackendError::denied(path)),
            None => return Err(BackendError::not_found(path)),
        };
        let cache: BlockCache = self.cache_for(file);
        Ok(cache.read(offset, length).await?)
    }

    fn registry(&self) -> &BufferRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for ImageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBackend")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Image building
// ============================================================================

/// Build an image of the local directory `root`, hashing every file.
///
/// Symlinks are followed. Entries that are neither files nor directories are
/// skipped.
///
/// # Arguments
/// * `root` - Directory to image
///
/// # Returns
/// A directory node describing the whole tree.
///
/// # Errors
/// Returns `BackendError::RootMissing` if `root` is not a directory and
/// `BackendError::Io` if an entry cannot be read or hashed.
pub fn build_image(root: &Path) -> Result<ImageNode, BackendError> {
    if !root.is_dir() {
        return Err(BackendError::RootMissing {
            root: root.display().to_string(),
        });
    }

    let mut tree: BTreeMap<String, ImageNode> = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry: walkdir::DirEntry = entry.map_err(|e| BackendError::Io {
            path: e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            message: e.to_string(),
        })?;

        let path: &Path = entry.path();
        if path == root {
            continue;
        }

        let keys: Vec<String> = relative_keys(path, root)?;
        let node: ImageNode = if entry.file_type().is_dir() {
            ImageNode::empty_dir()
        } else if entry.file_type().is_file() {
            let size: u64 = entry.metadata().map_err(|e| io_error(path, e))?.len();
            let hash: String = content_id_for_file(path).map_err(|e| io_error(path, e))?;
            ImageFile::new(hash, size).into()
        } else {
            log::warn!("Skipping special file {}", path.display());
            continue;
        };

        log::debug!("adding {}", path.display());
        insert_nested(&mut tree, &keys, node)?;
    }

    Ok(ImageNode::Dir(tree))
}

impl From<ImageFile> for ImageNode {
    fn from(file: ImageFile) -> Self {
        ImageNode::File(file)
    }
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> BackendError {
    BackendError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn relative_keys(path: &Path, root: &Path) -> Result<Vec<String>, BackendError> {
    let relative: &Path = path.strip_prefix(root).map_err(|_| {
        BackendError::Path(rangefs_common::PathError::PathOutsideRoot {
            path: path.display().to_string(),
            root: root.display().to_string(),
        })
    })?;

    relative
        .components()
        .map(|component| {
            component
                .as_os_str()
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| {
                    BackendError::Path(rangefs_common::PathError::InvalidPath {
                        path: path.display().to_string(),
                    })
                })
        })
        .collect()
}

fn insert_nested(
    tree: &mut BTreeMap<String, ImageNode>,
    keys: &[String],
    node: ImageNode,
) -> Result<(), BackendError> {
    let Some((last, parents)) = keys.split_last() else {
        return Ok(());
    };

    let mut current: &mut BTreeMap<String, ImageNode> = tree;
    for key in parents {
        let child: &mut ImageNode = current
            .entry(key.clone())
            .or_insert_with(ImageNode::empty_dir);
        current = match child {
            ImageNode::Dir(children) => children,
            ImageNode::File(_) => {
                return Err(BackendError::InvalidImage {
                    message: format!("{} is both a file and a directory", key),
                })
            }
        };
    }
    current.insert(last.clone(), node);
    Ok(())
}
