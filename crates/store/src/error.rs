//! Error types for store operations

use crate::message::{ExpectedVersion, StreamId};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend engine error
    #[error("backend error: {0}")]
    Backend(String),

    /// Operation attempted after the store was shut down
    #[error("store has been disposed")]
    Disposed,

    /// Stream id failed validation
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    /// Database schema does not match the version this crate expects
    #[error("schema version mismatch: observed {observed}, expected {expected}")]
    SchemaVersionMismatch {
        /// Version reported by the database
        observed: u32,
        /// Version this crate is compatible with
        expected: u32,
    },

    /// Stream absent where one was required
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Append precondition failed
    #[error(
        "wrong expected version for stream {stream_id}: expected {expected}, current {current_version:?}"
    )]
    WrongExpectedVersion {
        /// Stream the append targeted
        stream_id: StreamId,
        /// The precondition the caller supplied
        expected: ExpectedVersion,
        /// The stream's actual current version (`None` when the stream
        /// is absent or holds no messages)
        current_version: Option<u64>,
    },
}

impl StoreError {
    /// Wrap a backend engine failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}
