//! Metadata cache
//!
//! Bounded, expiry-based cache of per-stream retention metadata. Two
//! independent pressure mechanisms: entries older than the TTL are
//! treated as absent and re-fetched, and once the map exceeds its
//! capacity the least-recently-used entries are evicted first.
//! Concurrent misses on one key coalesce into a single backend fetch.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::adaptor::Adaptor;
use crate::error::StoreResult;
use crate::message::StreamId;

/// A stream's retention metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Stream the metadata belongs to
    pub stream_id: StreamId,
    /// Messages older than this are expired
    pub max_age: Option<Duration>,
    /// Retain at most this many messages
    pub max_count: Option<u64>,
}

impl StreamMetadata {
    /// Metadata for a stream with no retention policy.
    pub fn none(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            max_age: None,
            max_count: None,
        }
    }
}

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a fresh entry
    pub hits: u64,
    /// Lookups that went to the backend
    pub misses: u64,
    /// Entries evicted by capacity pressure
    pub evictions: u64,
}

type Slot = Arc<Mutex<Option<(StreamMetadata, Instant)>>>;

#[derive(Clone)]
pub(crate) struct MetadataCache {
    adaptor: Arc<dyn Adaptor>,
    entries: Arc<Mutex<LruCache<StreamId, Slot>>>,
    ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl MetadataCache {
    pub(crate) fn new(adaptor: Arc<dyn Adaptor>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to at least 1");

        Self {
            adaptor,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Look up a stream's metadata, fetching through on a miss.
    ///
    /// The fetch runs while the entry's own lock is held, so
    /// concurrent misses on the same stream wait for the in-flight
    /// result instead of issuing duplicate fetches. Other streams are
    /// unaffected.
    pub(crate) async fn get(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata> {
        let slot = {
            let mut entries = self.entries.lock().await;
            if let Some(slot) = entries.get(stream_id) {
                Arc::clone(slot)
            } else {
                let slot: Slot = Arc::new(Mutex::new(None));
                if let Some((evicted, _)) = entries.push(stream_id.clone(), Arc::clone(&slot)) {
                    if evicted != *stream_id {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        trace!(stream_id = %evicted, "evicted metadata cache entry");
                    }
                }
                slot
            }
        };

        let mut guard = slot.lock().await;
        if let Some((metadata, fetched_at)) = guard.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(metadata.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(%stream_id, "metadata cache miss");

        let record = self.adaptor.get_metadata(stream_id).await?.unwrap_or_default();
        let metadata = StreamMetadata {
            stream_id: stream_id.clone(),
            max_age: record.max_age,
            max_count: record.max_count,
        };
        *guard = Some((metadata.clone(), Instant::now()));

        Ok(metadata)
    }

    /// Forget a stream's entry.
    pub(crate) async fn invalidate(&self, stream_id: &StreamId) {
        self.entries.lock().await.pop(stream_id);
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::MetadataRecord;
    use crate::testing::FakeAdaptor;

    fn fake_with_max_count(max_count: u64, delay: Option<Duration>) -> Arc<FakeAdaptor> {
        let adaptor = FakeAdaptor {
            metadata: std::sync::Mutex::new(Some(MetadataRecord {
                max_age: None,
                max_count: Some(max_count),
            })),
            metadata_fetch_delay: delay,
            ..FakeAdaptor::default()
        };
        Arc::new(adaptor)
    }

    fn cache_over(adaptor: &Arc<FakeAdaptor>, capacity: usize, ttl: Duration) -> MetadataCache {
        MetadataCache::new(Arc::clone(adaptor) as Arc<dyn Adaptor>, capacity, ttl)
    }

    fn fetches(adaptor: &Arc<FakeAdaptor>) -> usize {
        adaptor.metadata_fetches.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let adaptor = fake_with_max_count(5, Some(Duration::from_millis(10)));
        let cache = cache_over(&adaptor, 16, Duration::from_secs(60));
        let stream_id = StreamId::from("stream-1");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let stream_id = stream_id.clone();
            tasks.push(tokio::spawn(async move { cache.get(&stream_id).await }));
        }

        for task in tasks {
            let metadata = task.await.unwrap().unwrap();
            assert_eq!(metadata.max_count, Some(5));
        }

        assert_eq!(fetches(&adaptor), 1);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let adaptor = fake_with_max_count(5, None);
        let cache = cache_over(&adaptor, 16, Duration::ZERO);
        let stream_id = StreamId::from("stream-1");

        cache.get(&stream_id).await.unwrap();
        cache.get(&stream_id).await.unwrap();

        assert_eq!(fetches(&adaptor), 2);
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn least_recently_used_evicted_first() {
        let adaptor = fake_with_max_count(5, None);
        let cache = cache_over(&adaptor, 2, Duration::from_secs(60));

        let a = StreamId::from("a");
        let b = StreamId::from("b");
        let c = StreamId::from("c");

        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        // Touch `a` so `b` is now the least recently used.
        cache.get(&a).await.unwrap();
        // Inserting `c` evicts `b`.
        cache.get(&c).await.unwrap();

        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(fetches(&adaptor), 3);

        // `a` survived, `b` did not.
        cache.get(&a).await.unwrap();
        assert_eq!(fetches(&adaptor), 3);
        cache.get(&b).await.unwrap();
        assert_eq!(fetches(&adaptor), 4);
    }

    #[tokio::test]
    async fn unknown_streams_cache_empty_metadata() {
        let adaptor = Arc::new(FakeAdaptor::default());
        let cache = cache_over(&adaptor, 16, Duration::from_secs(60));
        let stream_id = StreamId::from("missing");

        let metadata = cache.get(&stream_id).await.unwrap();
        assert_eq!(metadata, StreamMetadata::none(stream_id.clone()));

        cache.get(&stream_id).await.unwrap();
        assert_eq!(fetches(&adaptor), 1);
    }
}
