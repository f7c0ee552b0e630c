//! Read pages and their continuations
//!
//! Pages never retain an open cursor. Advancing a read session happens
//! through the page's bound continuation, which re-invokes the paged
//! read at the next cursor with the original direction, count and
//! prefetch settings.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::StoreResult;
use crate::message::StreamMessage;
use crate::position::{Position, ReadDirection, Version};

/// Bound continuation for an all-stream read session.
pub type ReadNextAllPage =
    Arc<dyn Fn(Position) -> BoxFuture<'static, StoreResult<ReadAllPage>> + Send + Sync>;

/// Bound continuation for a single-stream read session.
pub type ReadNextStreamPage =
    Arc<dyn Fn(Version) -> BoxFuture<'static, StoreResult<ReadStreamPage>> + Send + Sync>;

/// One page of an all-stream read.
#[derive(Clone)]
pub struct ReadAllPage {
    /// Cursor the page was read from
    pub from_position: Position,
    /// Cursor for the next page
    pub next_position: Position,
    /// Whether the read reached the end of the log
    pub is_end: bool,
    /// Direction of the read
    pub direction: ReadDirection,
    /// Messages in read order
    pub messages: Vec<StreamMessage>,
    read_next: ReadNextAllPage,
}

impl ReadAllPage {
    pub(crate) fn new(
        from_position: Position,
        next_position: Position,
        is_end: bool,
        direction: ReadDirection,
        messages: Vec<StreamMessage>,
        read_next: ReadNextAllPage,
    ) -> Self {
        Self {
            from_position,
            next_position,
            is_end,
            direction,
            messages,
            read_next,
        }
    }

    /// Read the next page of this session.
    pub async fn read_next(&self) -> StoreResult<Self> {
        (self.read_next)(self.next_position).await
    }
}

impl fmt::Debug for ReadAllPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadAllPage")
            .field("from_position", &self.from_position)
            .field("next_position", &self.next_position)
            .field("is_end", &self.is_end)
            .field("direction", &self.direction)
            .field("messages", &self.messages.len())
            .finish_non_exhaustive()
    }
}

/// One page of a single-stream read.
#[derive(Clone)]
pub struct ReadStreamPage {
    /// Cursor the page was read from
    pub from_version: Version,
    /// Cursor for the next page
    pub next_version: Version,
    /// Whether the read reached the end of the stream
    pub is_end: bool,
    /// Direction of the read
    pub direction: ReadDirection,
    /// Messages in read order
    pub messages: Vec<StreamMessage>,
    read_next: ReadNextStreamPage,
}

impl ReadStreamPage {
    pub(crate) fn new(
        from_version: Version,
        next_version: Version,
        is_end: bool,
        direction: ReadDirection,
        messages: Vec<StreamMessage>,
        read_next: ReadNextStreamPage,
    ) -> Self {
        Self {
            from_version,
            next_version,
            is_end,
            direction,
            messages,
            read_next,
        }
    }

    /// Read the next page of this session.
    pub async fn read_next(&self) -> StoreResult<Self> {
        (self.read_next)(self.next_version).await
    }
}

impl fmt::Debug for ReadStreamPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStreamPage")
            .field("from_version", &self.from_version)
            .field("next_version", &self.next_version)
            .field("is_end", &self.is_end)
            .field("direction", &self.direction)
            .field("messages", &self.messages.len())
            .finish_non_exhaustive()
    }
}
