//! Block-wise prefetching cache for a single content stream.
//!
//! A stream is split into fixed-size blocks addressed by
//! `index = offset / block_size`. Reads are served block by block; missing
//! blocks are fetched from the [`RangeSource`] in one request each, blocks
//! ahead of the read position are fetched in the background, and the least
//! recently accessed block is evicted once the resident count exceeds the
//! configured limit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        BlockCache                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  cached:      HashMap<index, Arc<Vec<u8>>>             │  │
//! │  │  last_access: HashMap<index, tick>                     │  │
//! │  │  in_flight:   HashMap<index, Shared<Future>>           │  │
//! │  │  stream_end:  Option<u64>                              │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                  one Mutex, never held across .await         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per block index: `Unknown -> InFlight -> Cached -> (evicted) Unknown`.
//! A block is never resident and in flight at the same time.
//!
//! # Fetch coordination
//!
//! Every outstanding fetch (foreground or prefetch) is registered in
//! `in_flight` together with a shared future fed by a oneshot channel. A
//! reader that finds its block in flight awaits that future, bounded by
//! `wait_timeout`, instead of issuing a second request. A failed prefetch
//! leaves its marker in place and never resolves, so readers that later need
//! the block run into [`CacheError::CacheTimeout`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CacheError, SourceError};
use crate::options::BlockCacheConfig;
use crate::source::RangeSource;

/// Result of a block fetch, shared with every waiter.
type FetchResult = Result<Arc<Vec<u8>>, CacheError>;

/// Shared future for coordinating concurrent waiters on one block.
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

// ============================================================================
// Fetch Request
// ============================================================================

/// Who asked for a fetch. Decides what happens when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    /// A reader needs the block now and awaits the result.
    Foreground,
    /// Speculative fetch ahead of the read position.
    Prefetch,
}

/// Byte range covering one block.
#[derive(Debug, Clone, Copy)]
struct FetchRequest {
    block: u64,
    offset: u64,
    length: u64,
}

// ============================================================================
// Cache State
// ============================================================================

/// Mutable state of one cache, guarded by a single mutex.
struct CacheState {
    /// Resident blocks.
    cached: HashMap<u64, Arc<Vec<u8>>>,
    /// Logical access time per resident block (higher = more recent).
    last_access: HashMap<u64, u64>,
    /// Blocks with an outstanding fetch.
    in_flight: HashMap<u64, SharedFetch>,
    /// Total stream length once known. Once set it can only be lowered.
    stream_end: Option<u64>,
    /// Monotonic counter feeding `last_access`.
    clock: u64,
}

impl CacheState {
    fn new(stream_end: Option<u64>) -> Self {
        Self {
            cached: HashMap::new(),
            last_access: HashMap::new(),
            in_flight: HashMap::new(),
            stream_end,
            clock: 0,
        }
    }

    /// Stamp a resident block as most recently used.
    fn touch(&mut self, block: u64) {
        self.clock += 1;
        self.last_access.insert(block, self.clock);
    }

    /// Make a block resident. The caller must have cleared its in-flight marker.
    fn insert(&mut self, block: u64, data: Arc<Vec<u8>>) {
        assert!(
            !self.in_flight.contains_key(&block),
            "block {} made resident while its fetch is still registered",
            block
        );
        self.cached.insert(block, data);
        self.touch(block);
    }

    /// Byte range to fetch for `block`, clamped to the known end.
    ///
    /// # Returns
    /// None if the block starts at or past the known end.
    fn request_for(&self, block: u64, block_size: u64) -> Option<FetchRequest> {
        let offset: u64 = block.checked_mul(block_size)?;
        let length: u64 = match self.stream_end {
            Some(end) if offset >= end => return None,
            Some(end) => block_size.min(end - offset),
            None => block_size,
        };
        Some(FetchRequest {
            block,
            offset,
            length,
        })
    }

    /// Record a stream end and forget every block lying past it.
    ///
    /// Both resident blocks and in-flight markers go. A job whose marker was
    /// dropped still completes and answers its waiters, but its block is not
    /// kept.
    fn record_end(&mut self, end: u64, block_size: u64) {
        self.stream_end = Some(end);
        let past_end = |block: &u64| block.saturating_mul(block_size) >= end;

        self.cached.retain(|block, _| !past_end(block));
        self.last_access.retain(|block, _| !past_end(block));
        self.in_flight.retain(|block, _| !past_end(block));
    }

    /// Apply the end implied by a fetch that came back short.
    ///
    /// The end is `offset + returned`. An empty fetch beyond the real end
    /// yields an end that is too high; a later short fetch lowers it.
    ///
    /// # Returns
    /// The new end, if it changed.
    fn note_short_fetch(
        &mut self,
        request: FetchRequest,
        returned: u64,
        block_size: u64,
    ) -> Option<u64> {
        let end: u64 = request.offset + returned;
        if self.stream_end.is_some_and(|known: u64| known <= end) {
            return None;
        }
        self.record_end(end, block_size);
        Some(end)
    }

    /// Register an outstanding fetch for `block`.
    ///
    /// # Returns
    /// The sender the fetch job uses to publish its result.
    fn register_fetch(&mut self, block: u64) -> oneshot::Sender<FetchResult> {
        let (tx, rx) = oneshot::channel::<FetchResult>();

        // A dropped sender means an abandoned prefetch: stay pending so
        // waiters hit their timeout.
        let shared: SharedFetch = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => futures::future::pending::<FetchResult>().await,
            }
        }
        .boxed()
        .shared();

        self.in_flight.insert(block, shared);
        tx
    }

    /// Least recently accessed resident block.
    fn oldest_block(&self) -> Option<u64> {
        self.last_access
            .iter()
            .min_by_key(|(_, tick)| **tick)
            .map(|(block, _)| *block)
    }
}

// ============================================================================
// Block Cache Stats
// ============================================================================

/// Snapshot of a block cache's state and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCacheStats {
    /// Number of resident blocks.
    pub cached_blocks: usize,
    /// Number of blocks with an outstanding fetch.
    pub in_flight_blocks: usize,
    /// Stream length, if known.
    pub stream_end: Option<u64>,
    /// Reads served from an already-resident block.
    pub hits: u64,
    /// Fetches issued on behalf of a waiting reader.
    pub sync_fetches: u64,
    /// Background fetches launched.
    pub prefetches_started: u64,
    /// Blocks evicted.
    pub evictions: u64,
}

// ============================================================================
// Block Cache Inner
// ============================================================================

struct BlockCacheInner {
    config: BlockCacheConfig,
    source: Arc<dyn RangeSource>,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    sync_fetches: AtomicU64,
    prefetches_started: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("block cache state lock poisoned")
    }

    /// Evict the least recently accessed block if over the resident limit.
    fn evict_over_limit(&self, state: &mut CacheState) {
        if state.cached.len() <= self.config.cache_limit {
            return;
        }
        if let Some(victim) = state.oldest_block() {
            state.cached.remove(&victim);
            state.last_access.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(block = victim, "evicted block");
        }
    }

    /// Publish the outcome of a fetch job.
    ///
    /// Clears the in-flight marker and makes the block resident in the same
    /// critical section, except for failed prefetches, which keep their
    /// marker.
    fn complete_fetch(
        &self,
        request: FetchRequest,
        kind: FetchKind,
        result: Result<Vec<u8>, SourceError>,
        tx: oneshot::Sender<FetchResult>,
    ) -> FetchResult {
        let result: Result<Vec<u8>, SourceError> = result.and_then(|bytes: Vec<u8>| {
            if bytes.len() as u64 > request.length {
                Err(SourceError::Overrun {
                    requested: request.length,
                    returned: bytes.len() as u64,
                })
            } else {
                Ok(bytes)
            }
        });

        let mut state: MutexGuard<'_, CacheState> = self.lock_state();

        match result {
            Ok(bytes) => {
                let data: Arc<Vec<u8>> = Arc::new(bytes);
                state.in_flight.remove(&request.block);

                let returned: u64 = data.len() as u64;
                if returned < request.length {
                    let block_size: u64 = self.config.block_size;
                    if let Some(end) = state.note_short_fetch(request, returned, block_size) {
                        debug!(block = request.block, end, "discovered stream end");
                    }
                }

                let within_stream: bool = state
                    .stream_end
                    .map_or(true, |end: u64| request.offset < end);
                if within_stream && !data.is_empty() {
                    state.insert(request.block, data.clone());
                    // Readers run the eviction check for their own inserts.
                    if kind == FetchKind::Prefetch {
                        self.evict_over_limit(&mut state);
                    }
                }

                let _ = tx.send(Ok(data.clone()));
                Ok(data)
            }
            Err(source) => {
                let err: CacheError = CacheError::SourceFetch {
                    offset: request.offset,
                    length: request.length,
                    source,
                };
                match kind {
                    FetchKind::Foreground => {
                        state.in_flight.remove(&request.block);
                        let _ = tx.send(Err(err.clone()));
                    }
                    FetchKind::Prefetch => {
                        warn!(
                            block = request.block,
                            error = %err,
                            "prefetch failed, block left in flight"
                        );
                        drop(tx);
                    }
                }
                Err(err)
            }
        }
    }
}

// ============================================================================
// Block Cache (Public API)
// ============================================================================

/// Prefetching block cache over one content stream.
///
/// Cloning is cheap; clones share the same cache. Must be used from within a
/// tokio runtime, since fetches run as spawned tasks.
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<BlockCacheInner>,
}

/// How a block was obtained for one step of a read.
struct Obtained {
    data: Arc<Vec<u8>>,
    /// True if this step put the block into the cache.
    inserted: bool,
}

impl BlockCache {
    /// Create a cache reading through `source`.
    ///
    /// # Arguments
    /// * `source` - Backing store for this stream
    /// * `config` - Tuning parameters
    ///
    /// # Errors
    /// Returns `CacheError::InvalidConfig` if the configuration is unusable.
    pub fn new(
        source: Arc<dyn RangeSource>,
        config: BlockCacheConfig,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self::from_validated(source, config))
    }

    /// Create a cache from a configuration that already passed validation.
    pub(crate) fn from_validated(source: Arc<dyn RangeSource>, config: BlockCacheConfig) -> Self {
        let state: CacheState = CacheState::new(config.known_size);
        Self {
            inner: Arc::new(BlockCacheInner {
                config,
                source,
                state: Mutex::new(state),
                hits: AtomicU64::new(0),
                sync_fetches: AtomicU64::new(0),
                prefetches_started: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Returns fewer than `length` bytes only when the range runs past the
    /// stream end, in which case `max(0, end - offset)` bytes come back.
    /// Multi-block ranges are assembled in a loop, one block per iteration,
    /// so the iteration count is bounded by `length / block_size + 1`.
    ///
    /// # Arguments
    /// * `offset` - Absolute start offset
    /// * `length` - Maximum number of bytes to return
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` if `offset + length` overflows
    /// * `CacheError::CacheTimeout` if a block in flight does not arrive in time
    /// * `CacheError::SourceFetch` if the source fails
    pub async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, CacheError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if offset.checked_add(length).is_none() {
            return Err(CacheError::InvalidArgument {
                message: format!("offset {} + length {} overflows", offset, length),
            });
        }

        let mut out: Vec<u8> = Vec::new();
        let mut position: u64 = offset;
        let mut remaining: u64 = length;

        loop {
            if self.past_end(position) {
                break;
            }

            self.prefetch(position);

            let block: u64 = self.block_index(position);
            let obtained: Obtained = self.obtain_block(block).await?;

            let in_block: u64 = position - block * self.inner.config.block_size;
            let chunk: &[u8] = slice_block(&obtained.data, in_block, remaining);
            assert!(
                chunk.len() as u64 <= remaining,
                "slice of block {} yielded {} bytes, only {} requested",
                block,
                chunk.len(),
                remaining
            );
            out.extend_from_slice(chunk);

            let have: u64 = chunk.len() as u64;
            let step_start: u64 = position;
            position += have;
            remaining -= have;

            if obtained.inserted {
                self.evict_if_over_limit();
            }

            if remaining == 0 {
                self.prefetch(step_start);
                break;
            }
            // The block ended short of where the stream end was thought to be.
            if have == 0 {
                break;
            }
        }

        Ok(out)
    }

    /// Read with signed arguments as handed over by a filesystem layer.
    ///
    /// # Arguments
    /// * `offset` - Start offset, must be non-negative
    /// * `length` - Byte count, must be non-negative
    ///
    /// # Errors
    /// Returns `CacheError::InvalidArgument` for negative values, otherwise
    /// whatever [`read`](Self::read) returns.
    pub async fn read_signed(&self, offset: i64, length: i64) -> Result<Vec<u8>, CacheError> {
        if offset < 0 || length < 0 {
            return Err(CacheError::InvalidArgument {
                message: format!(
                    "offset ({}) and length ({}) can't be negative",
                    offset, length
                ),
            });
        }
        self.read(offset as u64, length as u64).await
    }

    /// Get the block, from the cache, from an in-flight fetch, or by fetching it.
    async fn obtain_block(&self, block: u64) -> Result<Obtained, CacheError> {
        enum Lookup {
            Cached(Arc<Vec<u8>>),
            Pending(SharedFetch),
            Fetch(FetchRequest, oneshot::Sender<FetchResult>),
        }

        let lookup: Lookup = {
            let mut state: MutexGuard<'_, CacheState> = self.inner.lock_state();

            let resident: Option<Arc<Vec<u8>>> = state.cached.get(&block).cloned();
            let pending: Option<SharedFetch> = state.in_flight.get(&block).cloned();

            if let Some(data) = resident {
                state.touch(block);
                Lookup::Cached(data)
            } else if let Some(pending) = pending {
                Lookup::Pending(pending)
            } else {
                // The read loop stops before a known end, so the block has bytes.
                let request: FetchRequest = state
                    .request_for(block, self.inner.config.block_size)
                    .ok_or_else(|| CacheError::InvalidArgument {
                        message: format!("block {} lies past the end of the stream", block),
                    })?;
                let tx: oneshot::Sender<FetchResult> = state.register_fetch(block);
                Lookup::Fetch(request, tx)
            }
        };

        match lookup {
            Lookup::Cached(data) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Obtained {
                    data,
                    inserted: false,
                })
            }
            Lookup::Pending(pending) => self.wait_for(block, pending).await,
            Lookup::Fetch(request, tx) => {
                debug!(block, offset = request.offset, length = request.length, "sync fetch");
                self.inner.sync_fetches.fetch_add(1, Ordering::Relaxed);
                let job: JoinHandle<FetchResult> =
                    self.spawn_fetch(request, FetchKind::Foreground, Duration::ZERO, tx);
                let data: Arc<Vec<u8>> = match job.await {
                    Ok(result) => result?,
                    Err(join_err) if join_err.is_panic() => {
                        std::panic::resume_unwind(join_err.into_panic())
                    }
                    Err(join_err) => {
                        return Err(CacheError::SourceFetch {
                            offset: request.offset,
                            length: request.length,
                            source: SourceError::Other {
                                message: format!("fetch job aborted: {}", join_err),
                            },
                        })
                    }
                };
                Ok(Obtained {
                    data,
                    inserted: true,
                })
            }
        }
    }

    /// Wait, bounded by the configured timeout, for an in-flight block.
    async fn wait_for(&self, block: u64, pending: SharedFetch) -> Result<Obtained, CacheError> {
        let wait_timeout: Duration = self.inner.config.wait_timeout;
        debug!(block, ?wait_timeout, "waiting for in-flight block");

        let data: Arc<Vec<u8>> = match tokio::time::timeout(wait_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(block, ?wait_timeout, "in-flight block took too long to arrive");
                return Err(CacheError::CacheTimeout {
                    block,
                    waited: wait_timeout,
                });
            }
        };

        // Refresh recency if it is still resident. It may already have been
        // evicted, in which case the published bytes are used directly.
        let mut state: MutexGuard<'_, CacheState> = self.inner.lock_state();
        let resident: Option<Arc<Vec<u8>>> = state.cached.get(&block).cloned();
        let data: Arc<Vec<u8>> = match resident {
            Some(resident) => {
                state.touch(block);
                resident
            }
            None => data,
        };
        Ok(Obtained {
            data,
            inserted: true,
        })
    }

    /// Launch background fetches for the blocks following `offset`'s block.
    ///
    /// Skips blocks already resident or in flight and blocks at or past a
    /// known end. Slot `idx` starts `idx * prefetch_stagger` late.
    fn prefetch(&self, offset: u64) {
        let prefetch_blocks: u32 = self.inner.config.prefetch_blocks;
        if prefetch_blocks == 0 {
            return;
        }

        let base: u64 = self.block_index(offset) + 1;
        let mut launches: Vec<(FetchRequest, oneshot::Sender<FetchResult>, Duration)> =
            Vec::new();
        {
            let mut state: MutexGuard<'_, CacheState> = self.inner.lock_state();
            for idx in 0..prefetch_blocks {
                let candidate: u64 = base + u64::from(idx);
                if state.cached.contains_key(&candidate)
                    || state.in_flight.contains_key(&candidate)
                {
                    continue;
                }
                let Some(request) = state.request_for(candidate, self.inner.config.block_size)
                else {
                    continue;
                };
                let tx: oneshot::Sender<FetchResult> = state.register_fetch(candidate);
                let delay: Duration = self.inner.config.prefetch_stagger * idx;
                launches.push((request, tx, delay));
            }
        }

        for (request, tx, delay) in launches {
            debug!(block = request.block, ?delay, "starting background load");
            self.inner.prefetches_started.fetch_add(1, Ordering::Relaxed);
            // Detached: prefetches run to completion whether or not anyone waits.
            drop(self.spawn_fetch(request, FetchKind::Prefetch, delay, tx));
        }
    }

    /// Spawn a job that fetches one block and publishes the result.
    fn spawn_fetch(
        &self,
        request: FetchRequest,
        kind: FetchKind,
        delay: Duration,
        tx: oneshot::Sender<FetchResult>,
    ) -> JoinHandle<FetchResult> {
        let inner: Arc<BlockCacheInner> = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result: Result<Vec<u8>, SourceError> =
                inner.source.fetch(request.offset, request.length).await;
            inner.complete_fetch(request, kind, result, tx)
        })
    }

    fn evict_if_over_limit(&self) {
        let mut state: MutexGuard<'_, CacheState> = self.inner.lock_state();
        self.inner.evict_over_limit(&mut state);
    }

    fn block_index(&self, offset: u64) -> u64 {
        offset / self.inner.config.block_size
    }

    fn past_end(&self, offset: u64) -> bool {
        self.stream_end().is_some_and(|end: u64| offset >= end)
    }

    /// Stream length, if known upfront or discovered.
    pub fn stream_end(&self) -> Option<u64> {
        self.inner.lock_state().stream_end
    }

    /// Whether the block at `index` is resident.
    pub fn is_cached(&self, index: u64) -> bool {
        self.inner.lock_state().cached.contains_key(&index)
    }

    /// Whether the block at `index` has an outstanding fetch.
    pub fn is_in_flight(&self, index: u64) -> bool {
        self.inner.lock_state().in_flight.contains_key(&index)
    }

    /// Configuration this cache was built with.
    pub fn config(&self) -> &BlockCacheConfig {
        &self.inner.config
    }

    /// Get a snapshot of the cache state and counters.
    pub fn stats(&self) -> BlockCacheStats {
        let state: MutexGuard<'_, CacheState> = self.inner.lock_state();
        BlockCacheStats {
            cached_blocks: state.cached.len(),
            in_flight_blocks: state.in_flight.len(),
            stream_end: state.stream_end,
            hits: self.inner.hits.load(Ordering::Relaxed),
            sync_fetches: self.inner.sync_fetches.load(Ordering::Relaxed),
            prefetches_started: self.inner.prefetches_started.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Slice up to `length` bytes of a block starting at `in_block`.
fn slice_block(data: &[u8], in_block: u64, length: u64) -> &[u8] {
    let len: u64 = data.len() as u64;
    let start: u64 = in_block.min(len);
    let end: u64 = in_block.saturating_add(length).min(len);
    &data[start as usize..end as usize]
}

// ============================================================================
// Tests
// ============================================================================
