//! The store front type

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adaptor::{Adaptor, MetadataRecord};
use crate::append;
use crate::cache::{CacheStats, MetadataCache, StreamMetadata};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::message::{AppendResult, ExpectedVersion, NewMessage, StreamId};
use crate::notifier::{BroadcastNotifier, Notifier};
use crate::page::{ReadAllPage, ReadStreamPage};
use crate::position::{Position, ReadDirection, Version};
use crate::reader;
use crate::schema::{CURRENT_SCHEMA_VERSION, CheckSchemaResult, FIRST_SCHEMA_VERSION};
use crate::subscription::{self, Subscription, SubscriptionHandler, Target};

pub(crate) struct Inner {
    pub(crate) adaptor: Arc<dyn Adaptor>,
    pub(crate) cache: MetadataCache,
    pub(crate) notifier: BroadcastNotifier,
    pub(crate) config: StoreConfig,
    pub(crate) shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

/// An append-only stream message store over a backend adaptor.
///
/// Cheap to clone; clones share the same metadata cache, notifier and
/// shutdown state.
#[derive(Clone)]
pub struct StreamStore {
    pub(crate) inner: Arc<Inner>,
}

impl StreamStore {
    /// Create a store over the given adaptor.
    pub fn new(adaptor: impl Adaptor, config: StoreConfig) -> Self {
        let adaptor: Arc<dyn Adaptor> = Arc::new(adaptor);
        let cache = MetadataCache::new(
            Arc::clone(&adaptor),
            config.metadata_cache_capacity,
            config.metadata_cache_ttl,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                adaptor,
                cache,
                notifier: BroadcastNotifier::new(),
                config,
                shutdown,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn guard_disposed(&self) -> StoreResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }

    fn ensure_writable(stream_id: &StreamId) -> StoreResult<()> {
        if stream_id.is_writable() {
            Ok(())
        } else {
            Err(StoreError::InvalidStreamId(stream_id.to_string()))
        }
    }

    /// Read the all-stream in position order, starting at `from`.
    pub async fn read_all_forwards(
        &self,
        from: Position,
        max_count: u64,
        prefetch: bool,
    ) -> StoreResult<ReadAllPage> {
        reader::read_all(
            self.clone(),
            ReadDirection::Forward,
            from,
            max_count,
            prefetch,
        )
        .await
    }

    /// Read the all-stream in reverse position order, starting at
    /// `from` (`End` reads from the tail).
    pub async fn read_all_backwards(
        &self,
        from: Position,
        max_count: u64,
        prefetch: bool,
    ) -> StoreResult<ReadAllPage> {
        reader::read_all(
            self.clone(),
            ReadDirection::Backward,
            from,
            max_count,
            prefetch,
        )
        .await
    }

    /// Read one stream in version order, starting at `from`.
    pub async fn read_stream_forwards(
        &self,
        stream_id: &StreamId,
        from: Version,
        max_count: u64,
        prefetch: bool,
    ) -> StoreResult<ReadStreamPage> {
        reader::read_stream(
            self.clone(),
            stream_id.clone(),
            ReadDirection::Forward,
            from,
            max_count,
            prefetch,
        )
        .await
    }

    /// Read one stream in reverse version order, starting at `from`
    /// (`End` reads from the tail).
    pub async fn read_stream_backwards(
        &self,
        stream_id: &StreamId,
        from: Version,
        max_count: u64,
        prefetch: bool,
    ) -> StoreResult<ReadStreamPage> {
        reader::read_stream(
            self.clone(),
            stream_id.clone(),
            ReadDirection::Backward,
            from,
            max_count,
            prefetch,
        )
        .await
    }

    /// Append `messages` to `stream_id` under the given precondition.
    ///
    /// All messages commit contiguously or none do. A retried call
    /// with the same message ids against a stream already reflecting
    /// that batch returns the prior success instead of conflicting;
    /// this does not apply under [`ExpectedVersion::Any`]. Conflicts
    /// surface as [`StoreError::WrongExpectedVersion`] and are never
    /// retried here.
    pub async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        messages: Vec<NewMessage>,
    ) -> StoreResult<AppendResult> {
        self.guard_disposed()?;
        append::append_to_stream(self, stream_id, expected, messages).await
    }

    /// The stream's retention metadata, via the metadata cache.
    pub async fn get_stream_metadata(&self, stream_id: &StreamId) -> StoreResult<StreamMetadata> {
        self.guard_disposed()?;
        self.inner.cache.get(stream_id).await
    }

    /// Store the stream's retention metadata, creating the stream if
    /// absent.
    pub async fn set_stream_metadata(
        &self,
        stream_id: &StreamId,
        max_age: Option<Duration>,
        max_count: Option<u64>,
    ) -> StoreResult<()> {
        self.guard_disposed()?;
        Self::ensure_writable(stream_id)?;

        self.inner
            .adaptor
            .set_metadata(stream_id, MetadataRecord { max_age, max_count })
            .await?;
        self.inner.cache.invalidate(stream_id).await;
        Ok(())
    }

    /// Delete a stream and all its messages, leaving a gap in the
    /// all-stream. Returns whether the stream existed.
    pub async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool> {
        self.guard_disposed()?;
        Self::ensure_writable(stream_id)?;

        let existed = self.inner.adaptor.delete_stream(stream_id).await?;
        self.inner.cache.invalidate(stream_id).await;
        Ok(existed)
    }

    /// Delete one message by id. Returns whether it existed.
    pub async fn delete_message(
        &self,
        stream_id: &StreamId,
        message_id: Uuid,
    ) -> StoreResult<bool> {
        self.guard_disposed()?;
        Self::ensure_writable(stream_id)?;
        self.inner.adaptor.delete_message(stream_id, message_id).await
    }

    /// Highest committed global position, or `None` for an empty log.
    pub async fn head_position(&self) -> StoreResult<Option<u64>> {
        self.guard_disposed()?;
        self.inner.adaptor.head_position().await
    }

    /// Number of messages in the stream.
    ///
    /// An existing-but-empty stream counts zero; an absent stream is
    /// [`StoreError::StreamNotFound`].
    pub async fn stream_message_count(&self, stream_id: &StreamId) -> StoreResult<u64> {
        self.guard_disposed()?;
        self.inner
            .adaptor
            .message_count(stream_id)
            .await?
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.clone()))
    }

    /// Probe schema compatibility without side effects.
    ///
    /// An empty database reports [`FIRST_SCHEMA_VERSION`] rather than
    /// erroring.
    pub async fn check_schema(&self) -> StoreResult<CheckSchemaResult> {
        self.guard_disposed()?;
        let observed = self
            .inner
            .adaptor
            .schema_version()
            .await?
            .unwrap_or(FIRST_SCHEMA_VERSION);
        Ok(CheckSchemaResult::new(observed, CURRENT_SCHEMA_VERSION))
    }

    /// Create the backend schema.
    pub async fn create_schema(&self) -> StoreResult<()> {
        self.guard_disposed()?;
        debug!("creating schema");
        self.inner.adaptor.create_schema().await
    }

    /// Drop every backend object owned by this store.
    pub async fn drop_all(&self) -> StoreResult<()> {
        self.guard_disposed()?;
        debug!("dropping all schema objects");
        self.inner.adaptor.drop_all().await
    }

    /// Subscribe to the all-stream, delivering messages strictly after
    /// `after` (`Start` replays everything, `End` subscribes from now).
    pub fn subscribe_to_all(
        &self,
        after: Position,
        handler: impl SubscriptionHandler,
    ) -> StoreResult<Subscription> {
        self.guard_disposed()?;
        Ok(subscription::spawn(
            self,
            Target::All { after },
            Arc::new(handler),
        ))
    }

    /// Subscribe to one stream, delivering messages strictly after
    /// version `after`.
    pub fn subscribe_to_stream(
        &self,
        stream_id: &StreamId,
        after: Version,
        handler: impl SubscriptionHandler,
    ) -> StoreResult<Subscription> {
        self.guard_disposed()?;
        Ok(subscription::spawn(
            self,
            Target::Stream {
                stream_id: stream_id.clone(),
                after,
            },
            Arc::new(handler),
        ))
    }

    /// Forward an external notifier's signals into this store, for
    /// deployments where other processes write to the same database
    /// (pair with [`crate::PollingNotifier`]). Subscriptions observe
    /// the forwarded signals exactly like local commits. The
    /// forwarding task stops with the store or with the notifier.
    pub fn attach_notifier(&self, notifier: &dyn Notifier) {
        let mut listener = notifier.listen();
        let broadcast = self.inner.notifier.clone();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    signal = listener.recv() => {
                        match signal {
                            Some(()) => broadcast.notify(),
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// Metadata cache counters.
    pub fn metadata_cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Shut the store down: every subsequent operation fails with
    /// [`StoreError::Disposed`] and all subscriptions stop promptly.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            info!("stream store shutting down");
            let _ = self.inner.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("disposed", &self.inner.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
