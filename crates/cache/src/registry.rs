//! Registry of block caches keyed by content identity.
//!
//! Backends resolve a path to a content identity (a content hash, or a
//! path-derived key for local files) and ask the registry for that
//! identity's [`BlockCache`]. The first request creates the cache; every later
//! request for the same identity shares it, so identical content reached
//! through different paths is cached once. Entries live as long as the
//! registry.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::block_cache::BlockCache;
use crate::error::CacheError;
use crate::options::BlockCacheConfig;
use crate::source::RangeSource;

/// Identity of one content stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    /// Create a key from a content identity such as `xxh128:<hex>`.
    ///
    /// # Arguments
    /// * `id` - Content identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key for a local file whose content is identified by its path.
    ///
    /// # Arguments
    /// * `path` - Local file path
    pub fn for_path(path: &Path) -> Self {
        Self(format!("file:{}", path.display()))
    }

    /// The identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContentKey {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lazily populated map from content identity to its block cache.
pub struct BufferRegistry {
    /// Template for every cache created; `known_size` is filled per stream.
    config: BlockCacheConfig,
    caches: Mutex<HashMap<ContentKey, BlockCache>>,
}

impl BufferRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    /// * `config` - Tuning applied to every cache this registry creates
    ///
    /// # Errors
    /// Returns `CacheError::InvalidConfig` if the configuration is unusable.
    pub fn new(config: BlockCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            config,
            caches: Mutex::new(HashMap::new()),
        })
    }

    /// Create an empty registry with default tuning.
    pub fn with_defaults() -> Self {
        Self {
            config: BlockCacheConfig::default(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    fn lock_caches(&self) -> MutexGuard<'_, HashMap<ContentKey, BlockCache>> {
        self.caches.lock().expect("buffer registry lock poisoned")
    }

    /// Get the cache for `key`, creating it on first reference.
    ///
    /// When the cache already exists, `source` and `known_size` are ignored.
    ///
    /// # Arguments
    /// * `key` - Content identity
    /// * `source` - Backing store for the content
    /// * `known_size` - Total content length, if known
    pub fn get_or_create(
        &self,
        key: &ContentKey,
        source: Arc<dyn RangeSource>,
        known_size: Option<u64>,
    ) -> BlockCache {
        self.get_or_create_with(key, known_size, move || source)
    }

    /// Like [`get_or_create`](Self::get_or_create), building the source only
    /// when a new cache is needed.
    ///
    /// # Arguments
    /// * `key` - Content identity
    /// * `known_size` - Total content length, if known
    /// * `make_source` - Called at most once, under the registry lock
    pub fn get_or_create_with<F>(
        &self,
        key: &ContentKey,
        known_size: Option<u64>,
        make_source: F,
    ) -> BlockCache
    where
        F: FnOnce() -> Arc<dyn RangeSource>,
    {
        let mut caches: MutexGuard<'_, HashMap<ContentKey, BlockCache>> = self.lock_caches();
        if let Some(cache) = caches.get(key) {
            return cache.clone();
        }

        debug!(key = %key, ?known_size, "creating block cache");
        let config: BlockCacheConfig = self.config.clone().with_known_size(known_size);
        let cache: BlockCache = BlockCache::from_validated(make_source(), config);
        caches.insert(key.clone(), cache.clone());
        cache
    }

    /// Get the cache for `key` if it exists.
    pub fn get(&self, key: &ContentKey) -> Option<BlockCache> {
        self.lock_caches().get(key).cloned()
    }

    /// Number of registered caches.
    pub fn len(&self) -> usize {
        self.lock_caches().len()
    }

    /// Whether no cache has been created yet.
    pub fn is_empty(&self) -> bool {
        self.lock_caches().is_empty()
    }

    /// Identities of all registered caches, sorted.
    pub fn keys(&self) -> Vec<ContentKey> {
        let mut keys: Vec<ContentKey> = self.lock_caches().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Template configuration for new caches.
    pub fn config(&self) -> &BlockCacheConfig {
        &self.config
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("config", &self.config)
            .field("caches", &self.len())
            .finish()
    }
}
