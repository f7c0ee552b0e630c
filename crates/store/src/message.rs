//! Message and stream identity types

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::adaptor::{Adaptor, MessageRow};
use crate::error::StoreResult;

/// Stream ids beginning with this prefix are reserved.
pub const RESERVED_STREAM_PREFIX: &str = "$";

/// Identifies a single stream within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new stream id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a write target: non-empty, no
    /// whitespace, and not in the reserved namespace.
    pub fn is_writable(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with(RESERVED_STREAM_PREFIX)
            && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Precondition for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No concurrency check
    Any,
    /// The stream must not exist yet
    NoStream,
    /// The stream must exist and hold no messages
    EmptyStream,
    /// The stream's current version must equal this value exactly
    Exact(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::EmptyStream => write!(f, "empty stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// A message to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Caller-supplied unique id; idempotent retries key off it
    pub message_id: Uuid,
    /// Type tag
    pub message_type: String,
    /// JSON payload body
    pub json_data: String,
    /// Optional JSON metadata blob
    pub json_metadata: Option<String>,
}

impl NewMessage {
    /// Create a new message with the given id.
    pub fn new(
        message_id: Uuid,
        message_type: impl Into<String>,
        json_data: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            json_data: json_data.into(),
            json_metadata: None,
        }
    }

    /// Attach a JSON metadata blob.
    #[must_use]
    pub fn with_metadata(mut self, json_metadata: impl Into<String>) -> Self {
        self.json_metadata = Some(json_metadata.into());
        self
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResult {
    /// The stream's version after the append (`None` when the stream
    /// holds no messages)
    pub current_version: Option<u64>,
    /// Global position of the stream's latest message
    pub current_position: Option<u64>,
}

#[derive(Clone)]
enum Payload {
    /// Body materialized from the page's own rows
    Inline(Option<String>),
    /// Body fetched on demand, at most once
    Deferred {
        adaptor: Arc<dyn Adaptor>,
        stream_id: StreamId,
        stream_version: u64,
        cell: Arc<OnceCell<Option<String>>>,
    },
}

/// A committed, immutable message read from the store.
#[derive(Clone)]
pub struct StreamMessage {
    /// Stream the message belongs to
    pub stream_id: StreamId,
    /// Unique message id
    pub message_id: Uuid,
    /// 0-based position within its stream
    pub stream_version: u64,
    /// Global position within the all-stream
    pub position: u64,
    /// Commit timestamp
    pub created_at: DateTime<Utc>,
    /// Type tag
    pub message_type: String,
    /// Optional JSON metadata blob
    pub json_metadata: Option<String>,
    payload: Payload,
}

impl StreamMessage {
    pub(crate) fn from_row(row: MessageRow, prefetch: bool, adaptor: &Arc<dyn Adaptor>) -> Self {
        let payload = if prefetch {
            Payload::Inline(row.json_data)
        } else {
            Payload::Deferred {
                adaptor: Arc::clone(adaptor),
                stream_id: row.stream_id.clone(),
                stream_version: row.stream_version,
                cell: Arc::new(OnceCell::new()),
            }
        };

        Self {
            stream_id: row.stream_id,
            message_id: row.message_id,
            stream_version: row.stream_version,
            position: row.position,
            created_at: row.created_at,
            message_type: row.message_type,
            json_metadata: row.json_metadata,
            payload,
        }
    }

    /// The JSON payload body.
    ///
    /// Under prefetch this returns the value loaded with the page; in
    /// lazy mode the first call performs one extra backend round trip.
    /// `None` means the message body has since been deleted.
    pub async fn json_data(&self) -> StoreResult<Option<String>> {
        match &self.payload {
            Payload::Inline(data) => Ok(data.clone()),
            Payload::Deferred {
                adaptor,
                stream_id,
                stream_version,
                cell,
            } => cell
                .get_or_try_init(|| adaptor.load_payload(stream_id, *stream_version))
                .await
                .cloned(),
        }
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessage")
            .field("stream_id", &self.stream_id)
            .field("message_id", &self.message_id)
            .field("stream_version", &self.stream_version)
            .field("position", &self.position)
            .field("created_at", &self.created_at)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}
