//! Append path: expected-version enforcement and idempotent retries

use tracing::debug;

use crate::adaptor::{AppendCondition, CommitOutcome, StreamHead};
use crate::error::{StoreError, StoreResult};
use crate::message::{AppendResult, ExpectedVersion, NewMessage, StreamId};
use crate::position::ReadDirection;
use crate::store::StreamStore;

pub(crate) async fn append_to_stream(
    store: &StreamStore,
    stream_id: &StreamId,
    expected: ExpectedVersion,
    messages: Vec<NewMessage>,
) -> StoreResult<AppendResult> {
    if !stream_id.is_writable() {
        return Err(StoreError::InvalidStreamId(stream_id.to_string()));
    }

    let condition = match expected {
        ExpectedVersion::Any => AppendCondition::Always,
        ExpectedVersion::NoStream => AppendCondition::NoStream,
        ExpectedVersion::EmptyStream => AppendCondition::EmptyStream,
        ExpectedVersion::Exact(version) => AppendCondition::AtVersion(version),
    };

    let head = match store
        .inner
        .adaptor
        .commit_append(stream_id, condition, &messages)
        .await?
    {
        CommitOutcome::Committed(head) => head,
        CommitOutcome::VersionMismatch(head) => {
            if let Some(result) = retried_duplicate(store, stream_id, expected, &messages, head).await?
            {
                // Nothing new was written, so neither retention nor the
                // notifier runs.
                return Ok(result);
            }
            return Err(StoreError::WrongExpectedVersion {
                stream_id: stream_id.clone(),
                expected,
                current_version: head.version(),
            });
        }
    };

    let result = AppendResult {
        current_version: head.version(),
        current_position: head.position(),
    };

    if !messages.is_empty() {
        enforce_max_count(store, stream_id).await?;
        store.inner.notifier.notify();
    }

    Ok(result)
}

/// Detects a retried append of an already-applied batch: the stream's
/// head sits exactly where the batch would have left it and the stored
/// message ids over the target version range equal the batch's ids in
/// order. A stale expected version alone never qualifies.
async fn retried_duplicate(
    store: &StreamStore,
    stream_id: &StreamId,
    expected: ExpectedVersion,
    messages: &[NewMessage],
    head: StreamHead,
) -> StoreResult<Option<AppendResult>> {
    let count = messages.len() as u64;
    if count == 0 {
        return Ok(None);
    }

    let first_version = match expected {
        ExpectedVersion::Exact(version) => version + 1,
        ExpectedVersion::NoStream => 0,
        ExpectedVersion::Any | ExpectedVersion::EmptyStream => return Ok(None),
    };

    if head.version() != Some(first_version + count - 1) {
        return Ok(None);
    }

    let stored_ids = store
        .inner
        .adaptor
        .message_ids(stream_id, first_version, count)
        .await?;
    if stored_ids.len() as u64 != count {
        return Ok(None);
    }

    let all_match = stored_ids
        .iter()
        .zip(messages)
        .all(|(stored, message)| *stored == message.message_id);
    if !all_match {
        return Ok(None);
    }

    debug!(%stream_id, "append was a retried duplicate");
    Ok(Some(AppendResult {
        current_version: head.version(),
        current_position: head.position(),
    }))
}

/// Purge the oldest surplus messages when the stream's metadata caps
/// its count. The policy comes through the metadata cache, which is
/// what keeps this off the hot path for streams without one.
async fn enforce_max_count(store: &StreamStore, stream_id: &StreamId) -> StoreResult<()> {
    let metadata = store.inner.cache.get(stream_id).await?;
    let Some(max_count) = metadata.max_count else {
        return Ok(());
    };

    let count = store
        .inner
        .adaptor
        .message_count(stream_id)
        .await?
        .unwrap_or(0);
    if count <= max_count {
        return Ok(());
    }

    let surplus = count - max_count;
    let oldest = store
        .inner
        .adaptor
        .read_stream(stream_id, 0, surplus, ReadDirection::Forward, false)
        .await?;
    if let Some(last) = oldest.last() {
        debug!(%stream_id, surplus, "purging messages over max count");
        store
            .inner
            .adaptor
            .delete_messages_before(stream_id, last.stream_version + 1)
            .await?;
    }

    Ok(())
}
