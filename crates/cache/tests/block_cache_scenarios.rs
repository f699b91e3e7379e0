//! Integration tests for the block cache read path.
//!
//! Tests cover:
//! - Range composition across block boundaries
//! - Cache hits without further source traffic
//! - LRU eviction and refetch
//! - Stream end clamping and discovery
//! - Background prefetch
//! - Concurrent readers and fetch deduplication
//! - Bounded waits on in-flight blocks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rangefs_cache::{
    BlockCache, BlockCacheConfig, BlockCacheStats, BufferRegistry, CacheError, ContentKey,
    RangeSource, SourceError,
};

/// Source whose byte at absolute position `i` is `i % 256`.
///
/// Records every request and can slow fetches down to widen race windows.
#[derive(Debug)]
struct PatternSource {
    len: u64,
    delay: Duration,
    requests: Mutex<Vec<(u64, u64)>>,
    fetches: AtomicUsize,
}

impl PatternSource {
    fn new(len: u64) -> Self {
        Self {
            len,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    fn requested_offset(&self, offset: u64) -> usize {
        self.requests()
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }
}

#[async_trait]
impl RangeSource for PatternSource {
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((offset, length));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let end: u64 = (offset + length).min(self.len);
        Ok((offset.min(end)..end).map(|i: u64| (i % 256) as u8).collect())
    }
}

/// Source whose fetches never complete.
struct StalledSource;

#[async_trait]
impl RangeSource for StalledSource {
    async fn fetch(&self, _offset: u64, _length: u64) -> Result<Vec<u8>, SourceError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }
}

/// Source that serves block 0 and fails every other range.
struct FailAfterFirstBlock {
    block_size: u64,
}

#[async_trait]
impl RangeSource for FailAfterFirstBlock {
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>, SourceError> {
        if offset < self.block_size {
            Ok(vec![1; length as usize])
        } else {
            Err(SourceError::Io {
                message: "connection reset".to_string(),
            })
        }
    }
}

fn pattern(offset: u64, end: u64) -> Vec<u8> {
    (offset..end).map(|i: u64| (i % 256) as u8).collect()
}

/// blockSize 10, no prefetch, plenty of room.
fn base_config() -> BlockCacheConfig {
    BlockCacheConfig::default()
        .with_block_size(10)
        .with_cache_limit(8)
        .with_prefetch_blocks(0)
        .with_prefetch_stagger(Duration::ZERO)
        .with_wait_timeout(Duration::from_secs(2))
}

fn cache_over(source: &Arc<PatternSource>, config: BlockCacheConfig) -> BlockCache {
    BlockCache::new(source.clone(), config).unwrap()
}

/// Poll until `check` holds or the deadline passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// RANGE COMPOSITION
// =============================================================================

mod composition {
    use super::*;

    #[tokio::test]
    async fn test_whole_stream_from_three_sync_fetches() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(25));
        let cache: BlockCache = cache_over(&source, base_config().with_known_size(Some(25)));

        let data: Vec<u8> = cache.read(0, 25).await.unwrap();

        assert_eq!(data, pattern(0, 25));
        assert_eq!(source.requests(), vec![(0, 10), (10, 10), (20, 5)]);
    }

    #[tokio::test]
    async fn test_tiled_reads_match_single_read() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(97));
        let whole: Vec<u8> = cache_over(&source, base_config().with_known_size(Some(97)))
            .read(0, 97)
            .await
            .unwrap();

        for tile in [1u64, 3, 7, 10, 13, 40] {
            let source: Arc<PatternSource> = Arc::new(PatternSource::new(97));
            let cache: BlockCache = cache_over(&source, base_config().with_known_size(Some(97)));
            let mut tiled: Vec<u8> = Vec::new();
            let mut offset: u64 = 0;
            while offset < 97 {
                tiled.extend(cache.read(offset, tile).await.unwrap());
                offset += tile;
            }
            assert_eq!(tiled, whole, "tile size {}", tile);
        }
    }

    #[tokio::test]
    async fn test_repeated_read_is_identical() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(60));
        let cache: BlockCache = cache_over(&source, base_config());

        let first: Vec<u8> = cache.read(7, 31).await.unwrap();
        let second: Vec<u8> = cache.read(7, 31).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, pattern(7, 38));
    }

    #[tokio::test]
    async fn test_never_returns_more_than_requested() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(1000));
        let cache: BlockCache = cache_over(&source, base_config());

        for (offset, length) in [(0u64, 1u64), (9, 2), (15, 35), (99, 101), (995, 5)] {
            let data: Vec<u8> = cache.read(offset, length).await.unwrap();
            assert_eq!(data.len() as u64, length);
            assert_eq!(data, pattern(offset, offset + length));
        }
    }
}

// =============================================================================
// CACHE HITS AND EVICTION
// =============================================================================

mod eviction {
    use super::*;

    #[tokio::test]
    async fn test_cached_block_serves_without_source_calls() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(25));
        let cache: BlockCache = cache_over(&source, base_config().with_known_size(Some(25)));

        cache.read(10, 10).await.unwrap();
        let calls: usize = source.fetch_count();

        assert_eq!(cache.read(12, 5).await.unwrap(), pattern(12, 17));
        assert_eq!(source.fetch_count(), calls);
    }

    #[tokio::test]
    async fn test_limit_one_refetches_evicted_block() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(25));
        let cache: BlockCache = cache_over(
            &source,
            base_config().with_known_size(Some(25)).with_cache_limit(1),
        );

        cache.read(0, 10).await.unwrap();
        cache.read(10, 10).await.unwrap();
        assert!(!cache.is_cached(0));
        assert!(cache.is_cached(1));

        assert_eq!(cache.read(0, 5).await.unwrap(), pattern(0, 5));
        assert_eq!(source.requested_offset(0), 2);
    }

    #[tokio::test]
    async fn test_least_recently_accessed_block_is_evicted() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(100));
        let cache: BlockCache = cache_over(&source, base_config().with_cache_limit(3));

        cache.read(0, 1).await.unwrap(); // block 0
        cache.read(10, 1).await.unwrap(); // block 1
        cache.read(20, 1).await.unwrap(); // block 2
        cache.read(1, 1).await.unwrap(); // touch block 0, block 1 is now oldest
        cache.read(30, 1).await.unwrap(); // block 3 pushes one out

        let stats: BlockCacheStats = cache.stats();
        assert_eq!(stats.cached_blocks, 3);
        assert_eq!(stats.evictions, 1);
        assert!(cache.is_cached(0));
        assert!(!cache.is_cached(1));
        assert!(cache.is_cached(2));
        assert!(cache.is_cached(3));

        cache.read(10, 1).await.unwrap();
        assert_eq!(source.requested_offset(10), 2);
    }

    #[tokio::test]
    async fn test_prefetched_blocks_count_against_limit() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(200));
        let cache: BlockCache = cache_over(
            &source,
            base_config()
                .with_known_size(Some(200))
                .with_cache_limit(2)
                .with_prefetch_blocks(2),
        );

        for block in 0..15u64 {
            let offset: u64 = block * 10;
            assert_eq!(cache.read(offset, 10).await.unwrap(), pattern(offset, offset + 10));
            tokio::time::sleep(Duration::from_millis(20)).await;

            let resident: usize = cache.stats().cached_blocks;
            assert!(resident <= 3, "{} blocks resident after block {}", resident, block);
        }

        // Blocks 0..=16 were all made resident at some point.
        assert!(cache.stats().evictions >= 14);
    }
}

// =============================================================================
// STREAM END
// =============================================================================

mod stream_end {
    use super::*;

    #[tokio::test]
    async fn test_read_past_known_end_is_clamped() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(15));
        let cache: BlockCache = cache_over(&source, base_config().with_known_size(Some(15)));

        assert_eq!(cache.read(5, 20).await.unwrap(), pattern(5, 15));
        assert!(source.requests().iter().all(|(offset, _)| *offset < 15));
    }

    #[tokio::test]
    async fn test_read_past_discovered_end_is_clamped() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(15));
        let cache: BlockCache = cache_over(&source, base_config());

        assert_eq!(cache.read(5, 20).await.unwrap(), pattern(5, 15));
        assert_eq!(cache.stream_end(), Some(15));
        assert!(source.requests().iter().all(|(offset, _)| *offset < 15));
    }

    #[tokio::test]
    async fn test_no_request_past_discovered_end() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(15));
        let cache: BlockCache = cache_over(&source, base_config().with_prefetch_blocks(3));

        cache.read(10, 10).await.unwrap();
        assert_eq!(cache.stream_end(), Some(15));
        // Prefetches launched before the end was known drain on their own.
        assert!(eventually(|| cache.stats().in_flight_blocks == 0).await);
        let before: usize = source.fetch_count();

        assert!(cache.read(15, 1).await.unwrap().is_empty());
        assert!(cache.read(30, 10).await.unwrap().is_empty());
        assert_eq!(cache.read(0, 100).await.unwrap(), pattern(0, 15));

        assert!(source.requests()[before..]
            .iter()
            .all(|(offset, _)| *offset < 15));
    }

    #[tokio::test]
    async fn test_repeated_reads_past_unknown_end_ask_source_once() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(15));
        let cache: BlockCache = cache_over(&source, base_config());

        for _ in 0..3 {
            assert!(cache.read(35, 10).await.unwrap().is_empty());
        }
        assert_eq!(source.requests(), vec![(30, 10)]);
        assert!(cache.stream_end().is_some_and(|end: u64| end <= 30));

        // A short fetch inside the stream tightens the end to the real length.
        assert_eq!(cache.read(0, 100).await.unwrap(), pattern(0, 15));
        assert_eq!(cache.stream_end(), Some(15));
        assert!(cache.read(20, 5).await.unwrap().is_empty());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(0));
        let cache: BlockCache = cache_over(&source, base_config());

        assert!(cache.read(0, 10).await.unwrap().is_empty());
        assert_eq!(cache.stream_end(), Some(0));
        assert!(cache.read(0, 10).await.unwrap().is_empty());
        assert_eq!(source.fetch_count(), 1);
    }
}

// =============================================================================
// PREFETCH
// =============================================================================

mod prefetch {
    use super::*;

    #[tokio::test]
    async fn test_next_block_arrives_without_explicit_read() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(100));
        let cache: BlockCache = cache_over(&source, base_config().with_prefetch_blocks(1));

        assert_eq!(cache.read(0, 10).await.unwrap(), pattern(0, 10));

        assert!(eventually(|| cache.is_cached(1)).await);
        assert_eq!(source.requested_offset(10), 1);
        assert!(cache.stats().prefetches_started >= 1);

        assert_eq!(cache.read(10, 10).await.unwrap(), pattern(10, 20));
        assert_eq!(source.requested_offset(10), 1);
    }

    #[tokio::test]
    async fn test_prefetch_depth_and_no_duplicates() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(100));
        let cache: BlockCache = cache_over(&source, base_config().with_prefetch_blocks(2));

        cache.read(0, 5).await.unwrap();
        cache.read(5, 5).await.unwrap();

        assert!(eventually(|| cache.is_cached(1) && cache.is_cached(2)).await);
        assert!(!cache.is_cached(3));
        for offset in [0u64, 10, 20] {
            assert_eq!(source.requested_offset(offset), 1, "offset {}", offset);
        }
    }

    #[tokio::test]
    async fn test_prefetch_stops_at_known_end() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(25));
        let cache: BlockCache = cache_over(
            &source,
            base_config().with_known_size(Some(25)).with_prefetch_blocks(5),
        );

        cache.read(0, 1).await.unwrap();
        assert!(eventually(|| cache.is_cached(1) && cache.is_cached(2)).await);

        let mut requests: Vec<(u64, u64)> = source.requests();
        requests.sort();
        assert_eq!(requests, vec![(0, 10), (10, 10), (20, 5)]);
    }

    #[tokio::test]
    async fn test_disabled_prefetch_issues_only_sync_fetches() {
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(100));
        let cache: BlockCache = cache_over(&source, base_config());

        cache.read(0, 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.fetch_count(), 1);
        assert_eq!(cache.stats().prefetches_started, 0);
    }

    #[tokio::test]
    async fn test_failed_prefetch_times_out_later_reader() {
        let source: Arc<FailAfterFirstBlock> = Arc::new(FailAfterFirstBlock { block_size: 10 });
        let cache: BlockCache = BlockCache::new(
            source,
            base_config()
                .with_prefetch_blocks(1)
                .with_wait_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        assert_eq!(cache.read(0, 10).await.unwrap(), vec![1; 10]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_in_flight(1));

        let result: Result<Vec<u8>, CacheError> = cache.read(10, 5).await;
        match result {
            Err(err @ CacheError::CacheTimeout { block: 1, .. }) => assert!(err.is_retryable()),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(cache.is_in_flight(1));
        assert!(!cache.is_cached(1));
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disjoint_reads() {
        let source: Arc<PatternSource> =
            Arc::new(PatternSource::new(400).with_delay(Duration::from_millis(5)));
        let cache: BlockCache = cache_over(
            &source,
            base_config().with_cache_limit(64).with_prefetch_blocks(1),
        );

        let mut handles: Vec<tokio::task::JoinHandle<(u64, Vec<u8>)>> = Vec::new();
        for block in 0..40u64 {
            let cache: BlockCache = cache.clone();
            handles.push(tokio::spawn(async move {
                let offset: u64 = block * 10 + 2;
                (offset, cache.read(offset, 6).await.unwrap())
            }));
        }

        for (offset, data) in futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
        {
            assert_eq!(data, pattern(offset, offset + 6));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_block_fetched_once() {
        let source: Arc<PatternSource> =
            Arc::new(PatternSource::new(100).with_delay(Duration::from_millis(50)));
        let cache: BlockCache = cache_over(&source, base_config());

        let mut handles: Vec<tokio::task::JoinHandle<Vec<u8>>> = Vec::new();
        for i in 0..8u64 {
            let cache: BlockCache = cache.clone();
            handles.push(tokio::spawn(async move { cache.read(i, 2).await.unwrap() }));
        }

        let results: Vec<Vec<u8>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        for (i, data) in results.iter().enumerate() {
            assert_eq!(*data, pattern(i as u64, i as u64 + 2));
        }
        assert_eq!(source.requested_offset(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_fetch_times_out_waiter() {
        let cache: BlockCache = BlockCache::new(
            Arc::new(StalledSource),
            base_config()
                .with_prefetch_blocks(1)
                .with_wait_timeout(Duration::from_secs(3)),
        )
        .unwrap();

        // The first reader's own fetch never returns; it keeps block 0 in flight.
        let stuck: BlockCache = cache.clone();
        let _first: tokio::task::JoinHandle<Result<Vec<u8>, CacheError>> =
            tokio::spawn(async move { stuck.read(0, 5).await });
        while !cache.is_in_flight(0) {
            tokio::task::yield_now().await;
        }

        let started: tokio::time::Instant = tokio::time::Instant::now();
        let result: Result<Vec<u8>, CacheError> = cache.read(0, 5).await;

        assert!(matches!(result, Err(CacheError::CacheTimeout { block: 0, .. })));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(cache.is_in_flight(0));
    }

    #[tokio::test]
    async fn test_late_completion_still_resolves_other_waiters() {
        let source: Arc<PatternSource> =
            Arc::new(PatternSource::new(100).with_delay(Duration::from_millis(300)));
        let cache: BlockCache = cache_over(
            &source,
            base_config().with_wait_timeout(Duration::from_millis(50)),
        );

        let first: BlockCache = cache.clone();
        let owner: tokio::task::JoinHandle<Result<Vec<u8>, CacheError>> =
            tokio::spawn(async move { first.read(0, 4).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let impatient: Result<Vec<u8>, CacheError> = cache.read(0, 4).await;
        assert!(matches!(impatient, Err(CacheError::CacheTimeout { .. })));

        assert_eq!(owner.await.unwrap().unwrap(), pattern(0, 4));
        assert!(cache.is_cached(0));
        assert!(!cache.is_in_flight(0));
        assert_eq!(cache.read(0, 4).await.unwrap(), pattern(0, 4));
        assert_eq!(source.fetch_count(), 1);
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

mod registry {
    use super::*;

    #[tokio::test]
    async fn test_registry_shares_cache_between_lookups() {
        let registry: BufferRegistry = BufferRegistry::new(base_config()).unwrap();
        let source: Arc<PatternSource> = Arc::new(PatternSource::new(30));
        let key: ContentKey = ContentKey::new("xxh128:0123");

        let a: BlockCache = registry.get_or_create(&key, source.clone(), Some(30));
        a.read(0, 30).await.unwrap();

        let b: BlockCache = registry.get_or_create(&key, source.clone(), Some(30));
        assert_eq!(b.read(5, 10).await.unwrap(), pattern(5, 15));
        assert_eq!(source.fetch_count(), 3);
    }
}
