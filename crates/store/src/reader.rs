//! Paged reading for the all-stream and for individual streams
//!
//! Both directions share one algorithm: request one row more than the
//! caller asked for, and use the presence of that extra row to decide
//! whether the end of the log has been reached. The cursor bound is
//! inclusive; forward pages advance the cursor one past the last
//! returned row, backward pages report the last ordinal consumed from
//! the result set (which, when the extra row was discarded, is exactly
//! the first unread ordinal).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::adaptor::MessageRow;
use crate::error::StoreResult;
use crate::message::{StreamId, StreamMessage};
use crate::page::{ReadAllPage, ReadNextAllPage, ReadNextStreamPage, ReadStreamPage};
use crate::position::{Position, ReadDirection, Version};
use crate::store::StreamStore;

pub(crate) fn read_all(
    store: StreamStore,
    direction: ReadDirection,
    from: Position,
    max_count: u64,
    prefetch: bool,
) -> BoxFuture<'static, StoreResult<ReadAllPage>> {
    Box::pin(async move {
        store.guard_disposed()?;

        let read_next: ReadNextAllPage = {
            let store = store.clone();
            Arc::new(move |from| read_all(store.clone(), direction, from, max_count, prefetch))
        };

        let max_count = effective_count(max_count);
        match direction {
            ReadDirection::Forward => {
                read_all_forwards(&store, from, max_count, prefetch, read_next).await
            }
            ReadDirection::Backward => {
                read_all_backwards(&store, from, max_count, prefetch, read_next).await
            }
        }
    })
}

pub(crate) fn read_stream(
    store: StreamStore,
    stream_id: StreamId,
    direction: ReadDirection,
    from: Version,
    max_count: u64,
    prefetch: bool,
) -> BoxFuture<'static, StoreResult<ReadStreamPage>> {
    Box::pin(async move {
        store.guard_disposed()?;

        let read_next: ReadNextStreamPage = {
            let store = store.clone();
            let stream_id = stream_id.clone();
            Arc::new(move |from| {
                read_stream(
                    store.clone(),
                    stream_id.clone(),
                    direction,
                    from,
                    max_count,
                    prefetch,
                )
            })
        };

        let max_count = effective_count(max_count);
        match direction {
            ReadDirection::Forward => {
                read_stream_forwards(&store, &stream_id, from, max_count, prefetch, read_next)
                    .await
            }
            ReadDirection::Backward => {
                read_stream_backwards(&store, &stream_id, from, max_count, prefetch, read_next)
                    .await
            }
        }
    })
}

/// Requesting one extra row for end detection must not overflow.
fn effective_count(max_count: u64) -> u64 {
    if max_count == u64::MAX {
        max_count - 1
    } else {
        max_count
    }
}

fn is_expired(
    created_at: DateTime<Utc>,
    max_age: Option<std::time::Duration>,
    now: DateTime<Utc>,
) -> bool {
    match max_age.and_then(|age| chrono::Duration::from_std(age).ok()) {
        Some(age) => created_at
            .checked_add_signed(age)
            .is_some_and(|expires_at| expires_at <= now),
        None => false,
    }
}

async fn read_all_forwards(
    store: &StreamStore,
    from: Position,
    max_count: u64,
    prefetch: bool,
    read_next: ReadNextAllPage,
) -> StoreResult<ReadAllPage> {
    let direction = ReadDirection::Forward;

    let ordinal = match from {
        Position::Start => 0,
        Position::At(p) => p,
        // Nothing lies at or beyond the tail sentinel.
        Position::End => {
            return Ok(ReadAllPage::new(from, from, true, direction, Vec::new(), read_next));
        }
    };

    if max_count == 0 {
        return Ok(ReadAllPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let mut rows = store
        .inner
        .adaptor
        .read_all(ordinal, max_count + 1, direction, prefetch)
        .await?;

    if rows.is_empty() {
        return Ok(ReadAllPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let is_end = rows.len() as u64 <= max_count;
    if !is_end {
        rows.truncate(max_count as usize);
    }
    let next = Position::At(rows.last().map_or(ordinal, |row| row.position) + 1);

    let messages = all_stream_messages(store, rows, prefetch);
    Ok(ReadAllPage::new(from, next, is_end, direction, messages, read_next))
}

async fn read_all_backwards(
    store: &StreamStore,
    from: Position,
    max_count: u64,
    prefetch: bool,
    read_next: ReadNextAllPage,
) -> StoreResult<ReadAllPage> {
    let direction = ReadDirection::Backward;

    let ordinal = match from {
        Position::Start => 0,
        Position::At(p) => p,
        // The tail sentinel resolves to the actual head position.
        Position::End => match store.inner.adaptor.head_position().await? {
            Some(head) => head,
            None => {
                return Ok(ReadAllPage::new(
                    Position::Start,
                    Position::Start,
                    true,
                    direction,
                    Vec::new(),
                    read_next,
                ));
            }
        },
    };

    if max_count == 0 {
        return Ok(ReadAllPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let mut rows = store
        .inner
        .adaptor
        .read_all(ordinal, max_count + 1, direction, prefetch)
        .await?;

    if rows.is_empty() {
        return Ok(ReadAllPage::new(
            Position::Start,
            Position::Start,
            true,
            direction,
            Vec::new(),
            read_next,
        ));
    }

    // Rows descend, so the last row consumed is the lowest ordinal. It
    // stays the next cursor even when it was the discarded extra row:
    // that row is exactly the first unread one.
    let last_consumed = rows.last().map_or(ordinal, |row| row.position);
    let first_position = rows.first().map_or(ordinal, |row| row.position);

    let is_end = rows.len() as u64 <= max_count;
    if !is_end {
        rows.truncate(max_count as usize);
    }

    let messages = all_stream_messages(store, rows, prefetch);
    Ok(ReadAllPage::new(
        Position::At(first_position),
        Position::At(last_consumed),
        is_end,
        direction,
        messages,
        read_next,
    ))
}

async fn read_stream_forwards(
    store: &StreamStore,
    stream_id: &StreamId,
    from: Version,
    max_count: u64,
    prefetch: bool,
    read_next: ReadNextStreamPage,
) -> StoreResult<ReadStreamPage> {
    let direction = ReadDirection::Forward;

    let ordinal = match from {
        Version::Start => 0,
        Version::At(v) => v,
        Version::End => {
            return Ok(ReadStreamPage::new(from, from, true, direction, Vec::new(), read_next));
        }
    };

    if max_count == 0 {
        return Ok(ReadStreamPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let mut rows = store
        .inner
        .adaptor
        .read_stream(stream_id, ordinal, max_count + 1, direction, prefetch)
        .await?;

    if rows.is_empty() {
        return Ok(ReadStreamPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let is_end = rows.len() as u64 <= max_count;
    if !is_end {
        rows.truncate(max_count as usize);
    }
    let next = Version::At(rows.last().map_or(ordinal, |row| row.stream_version) + 1);

    let messages = stream_messages(store, stream_id, rows, prefetch).await?;
    Ok(ReadStreamPage::new(from, next, is_end, direction, messages, read_next))
}

async fn read_stream_backwards(
    store: &StreamStore,
    stream_id: &StreamId,
    from: Version,
    max_count: u64,
    prefetch: bool,
    read_next: ReadNextStreamPage,
) -> StoreResult<ReadStreamPage> {
    let direction = ReadDirection::Backward;

    let ordinal = match from {
        Version::Start => 0,
        Version::At(v) => v,
        Version::End => match store.inner.adaptor.stream_head(stream_id).await?.version() {
            Some(head) => head,
            None => {
                return Ok(ReadStreamPage::new(
                    Version::Start,
                    Version::Start,
                    true,
                    direction,
                    Vec::new(),
                    read_next,
                ));
            }
        },
    };

    if max_count == 0 {
        return Ok(ReadStreamPage::new(from, from, true, direction, Vec::new(), read_next));
    }

    let mut rows = store
        .inner
        .adaptor
        .read_stream(stream_id, ordinal, max_count + 1, direction, prefetch)
        .await?;

    if rows.is_empty() {
        return Ok(ReadStreamPage::new(
            Version::Start,
            Version::Start,
            true,
            direction,
            Vec::new(),
            read_next,
        ));
    }

    let last_consumed = rows.last().map_or(ordinal, |row| row.stream_version);
    let first_version = rows.first().map_or(ordinal, |row| row.stream_version);

    let is_end = rows.len() as u64 <= max_count;
    if !is_end {
        rows.truncate(max_count as usize);
    }

    let messages = stream_messages(store, stream_id, rows, prefetch).await?;
    Ok(ReadStreamPage::new(
        Version::At(first_version),
        Version::At(last_consumed),
        is_end,
        direction,
        messages,
        read_next,
    ))
}

/// All-stream rows already carry their stream's max-age policy, so
/// expiry filtering needs no extra round trip.
fn all_stream_messages(
    store: &StreamStore,
    rows: Vec<MessageRow>,
    prefetch: bool,
) -> Vec<StreamMessage> {
    let now = Utc::now();
    rows.into_iter()
        .filter(|row| !is_expired(row.created_at, row.max_age, now))
        .map(|row| StreamMessage::from_row(row, prefetch, &store.inner.adaptor))
        .collect()
}

/// Stream pages resolve the max-age policy through the metadata cache.
async fn stream_messages(
    store: &StreamStore,
    stream_id: &StreamId,
    rows: Vec<MessageRow>,
    prefetch: bool,
) -> StoreResult<Vec<StreamMessage>> {
    let metadata = store.inner.cache.get(stream_id).await?;
    let now = Utc::now();
    Ok(rows
        .into_iter()
        .filter(|row| !is_expired(row.created_at, metadata.max_age, now))
        .map(|row| StreamMessage::from_row(row, prefetch, &store.inner.adaptor))
        .collect())
}
