//! Backend adaptor contract
//!
//! The core drives one of these per store instance. Operations are
//! semantic: each acquires whatever connection it needs from its
//! engine, executes parameterized statements, and releases the
//! connection before returning. Nothing here hands a cursor or
//! connection back to the core; rows and scalars only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::message::{NewMessage, StreamId};
use crate::position::ReadDirection;

/// One row of a paged read, in the store's column shape.
///
/// `max_age` and `max_count` are the owning stream's retention policy,
/// joined into every row so all-stream readers can filter expired
/// messages without a metadata round trip. `json_data` is populated
/// only when the read ran with prefetch.
#[derive(Debug, Clone)]
pub struct MessageRow {
    /// Owning stream
    pub stream_id: StreamId,
    /// Owning stream's max-age policy
    pub max_age: Option<Duration>,
    /// Owning stream's max-count policy
    pub max_count: Option<u64>,
    /// 0-based version within the stream
    pub stream_version: u64,
    /// Global position (logical, 0-based)
    pub position: u64,
    /// Message id
    pub message_id: Uuid,
    /// Commit timestamp
    pub created_at: DateTime<Utc>,
    /// Type tag
    pub message_type: String,
    /// JSON metadata blob
    pub json_metadata: Option<String>,
    /// JSON payload body, prefetch only
    pub json_data: Option<String>,
}

/// Where a stream currently ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHead {
    /// The stream does not exist
    NotFound,
    /// The stream exists but holds no messages
    Empty,
    /// The stream's latest message
    At {
        /// Version of the latest message
        version: u64,
        /// Global position of the latest message
        position: u64,
    },
}

impl StreamHead {
    /// The current version, if any messages exist.
    pub fn version(self) -> Option<u64> {
        match self {
            Self::At { version, .. } => Some(version),
            Self::NotFound | Self::Empty => None,
        }
    }

    /// The current global position, if any messages exist.
    pub fn position(self) -> Option<u64> {
        match self {
            Self::At { position, .. } => Some(position),
            Self::NotFound | Self::Empty => None,
        }
    }
}

/// Precondition a backend enforces atomically with the insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendCondition {
    /// Append at the current end, creating the stream if needed
    Always,
    /// The stream must not exist
    NoStream,
    /// The stream must exist and hold no messages
    EmptyStream,
    /// The stream's current version must equal this value
    AtVersion(u64),
}

/// Outcome of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All rows committed; the stream's head after the commit
    Committed(StreamHead),
    /// The condition did not hold; nothing was written
    VersionMismatch(StreamHead),
}

/// A stream's retention policy as stored by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Messages older than this are expired
    pub max_age: Option<Duration>,
    /// Retain at most this many messages
    pub max_count: Option<u64>,
}

/// Storage engine adaptor consumed by the core.
///
/// Reads are bounded inclusively at the given ordinal and ordered by
/// position (all-stream) or version (single stream) in the requested
/// direction. Engine failures map into `StoreError::Backend` and
/// surface unchanged.
#[async_trait]
pub trait Adaptor: Send + Sync + 'static {
    /// Create the schema objects this adaptor needs.
    async fn create_schema(&self) -> StoreResult<()>;

    /// Drop every schema object this adaptor created.
    async fn drop_all(&self) -> StoreResult<()>;

    /// The schema version recorded in the database, or `None` for an
    /// empty/unversioned database.
    async fn schema_version(&self) -> StoreResult<Option<u32>>;

    /// Highest committed global position, or `None` for an empty log.
    async fn head_position(&self) -> StoreResult<Option<u64>>;

    /// Where the given stream currently ends.
    async fn stream_head(&self, stream_id: &StreamId) -> StoreResult<StreamHead>;

    /// Number of messages in the stream, or `None` if it does not exist.
    async fn message_count(&self, stream_id: &StreamId) -> StoreResult<Option<u64>>;

    /// Page of all-stream rows starting at `from_position` inclusive.
    async fn read_all(
        &self,
        from_position: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>>;

    /// Page of stream rows starting at `from_version` inclusive.
    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>>;

    /// Fetch one message's payload body; `None` if the message is gone.
    async fn load_payload(
        &self,
        stream_id: &StreamId,
        stream_version: u64,
    ) -> StoreResult<Option<String>>;

    /// Message ids at `from_version..`, ascending, up to `limit`.
    async fn message_ids(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
    ) -> StoreResult<Vec<Uuid>>;

    /// Atomically check `condition` and insert `rows` with contiguous
    /// stream versions and globally ordered positions. Nothing is
    /// written on a mismatch.
    async fn commit_append(
        &self,
        stream_id: &StreamId,
        condition: AppendCondition,
        rows: &[NewMessage],
    ) -> StoreResult<CommitOutcome>;

    /// The stream's retention policy, or `None` if the stream is
    /// unknown.
    async fn get_metadata(&self, stream_id: &StreamId) -> StoreResult<Option<MetadataRecord>>;

    /// Store the stream's retention policy, creating the stream record
    /// if absent.
    async fn set_metadata(&self, stream_id: &StreamId, record: MetadataRecord) -> StoreResult<()>;

    /// Delete a stream and all its messages. Returns whether it existed.
    async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool>;

    /// Delete one message by id. Returns whether it existed.
    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> StoreResult<bool>;

    /// Delete every message with version strictly below `version`.
    async fn delete_messages_before(
        &self,
        stream_id: &StreamId,
        version: u64,
    ) -> StoreResult<()>;
}

#[async_trait]
impl<T: Adaptor> Adaptor for std::sync::Arc<T> {
    async fn create_schema(&self) -> StoreResult<()> {
        (**self).create_schema().await
    }

    async fn drop_all(&self) -> StoreResult<()> {
        (**self).drop_all().await
    }

    async fn schema_version(&self) -> StoreResult<Option<u32>> {
        (**self).schema_version().await
    }

    async fn head_position(&self) -> StoreResult<Option<u64>> {
        (**self).head_position().await
    }

    async fn stream_head(&self, stream_id: &StreamId) -> StoreResult<StreamHead> {
        (**self).stream_head(stream_id).await
    }

    async fn message_count(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        (**self).message_count(stream_id).await
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        (**self)
            .read_all(from_position, limit, direction, prefetch)
            .await
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        (**self)
            .read_stream(stream_id, from_version, limit, direction, prefetch)
            .await
    }

    async fn load_payload(
        &self,
        stream_id: &StreamId,
        stream_version: u64,
    ) -> StoreResult<Option<String>> {
        (**self).load_payload(stream_id, stream_version).await
    }

    async fn message_ids(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
    ) -> StoreResult<Vec<Uuid>> {
        (**self).message_ids(stream_id, from_version, limit).await
    }

    async fn commit_append(
        &self,
        stream_id: &StreamId,
        condition: AppendCondition,
        rows: &[NewMessage],
    ) -> StoreResult<CommitOutcome> {
        (**self).commit_append(stream_id, condition, rows).await
    }

    async fn get_metadata(&self, stream_id: &StreamId) -> StoreResult<Option<MetadataRecord>> {
        (**self).get_metadata(stream_id).await
    }

    async fn set_metadata(&self, stream_id: &StreamId, record: MetadataRecord) -> StoreResult<()> {
        (**self).set_metadata(stream_id, record).await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool> {
        (**self).delete_stream(stream_id).await
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> StoreResult<bool> {
        (**self).delete_message(stream_id, message_id).await
    }

    async fn delete_messages_before(
        &self,
        stream_id: &StreamId,
        version: u64,
    ) -> StoreResult<()> {
        (**self).delete_messages_before(stream_id, version).await
    }
}
