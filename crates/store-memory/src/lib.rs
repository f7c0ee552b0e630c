//! In-memory (single node) storage adaptor for local development and
//! tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use weir_store::adaptor::{
    Adaptor, AppendCondition, CommitOutcome, MessageRow, MetadataRecord, StreamHead,
};
use weir_store::{CURRENT_SCHEMA_VERSION, ReadDirection, StoreResult, StreamId};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: Uuid,
    message_type: String,
    json_data: String,
    json_metadata: Option<String>,
    created_at: DateTime<Utc>,
    position: u64,
}

#[derive(Debug, Default)]
struct StreamState {
    metadata: MetadataRecord,
    /// Messages by stream version. Deletions leave the version counter
    /// alone so versions are never reused.
    messages: BTreeMap<u64, StoredMessage>,
    next_version: u64,
}

impl StreamState {
    fn head(&self) -> StreamHead {
        self.messages
            .last_key_value()
            .map_or(StreamHead::Empty, |(&version, message)| StreamHead::At {
                version,
                position: message.position,
            })
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamId, StreamState>,
    /// Global position index. Deletions leave gaps; positions are
    /// never reused.
    log: BTreeMap<u64, (StreamId, u64)>,
    next_position: u64,
}

impl State {
    fn row(&self, position: u64, prefetch: bool) -> Option<MessageRow> {
        let (stream_id, version) = self.log.get(&position)?;
        let stream = self.streams.get(stream_id)?;
        let message = stream.messages.get(version)?;
        Some(Self::to_row(stream_id, stream, *version, message, prefetch))
    }

    fn to_row(
        stream_id: &StreamId,
        stream: &StreamState,
        version: u64,
        message: &StoredMessage,
        prefetch: bool,
    ) -> MessageRow {
        MessageRow {
            stream_id: stream_id.clone(),
            max_age: stream.metadata.max_age,
            max_count: stream.metadata.max_count,
            stream_version: version,
            position: message.position,
            message_id: message.message_id,
            created_at: message.created_at,
            message_type: message.message_type.clone(),
            json_metadata: message.json_metadata.clone(),
            json_data: prefetch.then(|| message.json_data.clone()),
        }
    }
}

/// In-memory storage adaptor.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdaptor {
    state: Arc<Mutex<State>>,
}

impl MemoryAdaptor {
    /// Creates a new, empty adaptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Adaptor for MemoryAdaptor {
    async fn create_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn drop_all(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        *state = State::default();
        Ok(())
    }

    async fn schema_version(&self) -> StoreResult<Option<u32>> {
        Ok(Some(CURRENT_SCHEMA_VERSION))
    }

    async fn head_position(&self) -> StoreResult<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state.log.last_key_value().map(|(&position, _)| position))
    }

    async fn stream_head(&self, stream_id: &StreamId) -> StoreResult<StreamHead> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .map_or(StreamHead::NotFound, StreamState::head))
    }

    async fn message_count(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .map(|stream| stream.messages.len() as u64))
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let positions: Vec<u64> = match direction {
            ReadDirection::Forward => state.log.range(from_position..).map(|(&p, _)| p).collect(),
            ReadDirection::Backward => state
                .log
                .range(..=from_position)
                .rev()
                .map(|(&p, _)| p)
                .collect(),
        };

        Ok(positions
            .into_iter()
            .take(limit)
            .filter_map(|position| state.row(position, prefetch))
            .collect())
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let Some(stream) = state.streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        let rows: Vec<MessageRow> = match direction {
            ReadDirection::Forward => stream
                .messages
                .range(from_version..)
                .take(limit)
                .map(|(&version, message)| {
                    State::to_row(stream_id, stream, version, message, prefetch)
                })
                .collect(),
            ReadDirection::Backward => stream
                .messages
                .range(..=from_version)
                .rev()
                .take(limit)
                .map(|(&version, message)| {
                    State::to_row(stream_id, stream, version, message, prefetch)
                })
                .collect(),
        };

        Ok(rows)
    }

    async fn load_payload(
        &self,
        stream_id: &StreamId,
        stream_version: u64,
    ) -> StoreResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .and_then(|stream| stream.messages.get(&stream_version))
            .map(|message| message.json_data.clone()))
    }

    async fn message_ids(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
    ) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        Ok(state
            .streams
            .get(stream_id)
            .map(|stream| {
                stream
                    .messages
                    .range(from_version..)
                    .take(limit)
                    .map(|(_, message)| message.message_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit_append(
        &self,
        stream_id: &StreamId,
        condition: AppendCondition,
        rows: &[weir_store::NewMessage],
    ) -> StoreResult<CommitOutcome> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let current = state.streams.get(stream_id);
        let head = current.map_or(StreamHead::NotFound, |stream| stream.head());

        let holds = match condition {
            AppendCondition::Always => true,
            AppendCondition::NoStream => current.is_none(),
            AppendCondition::EmptyStream => matches!(head, StreamHead::Empty),
            AppendCondition::AtVersion(version) => head.version() == Some(version),
        };
        if !holds {
            return Ok(CommitOutcome::VersionMismatch(head));
        }

        let mut next_position = state.next_position;
        let stream = state.streams.entry(stream_id.clone()).or_default();
        let now = Utc::now();
        let mut log_entries = Vec::with_capacity(rows.len());

        for message in rows {
            let version = stream.next_version;
            stream.messages.insert(
                version,
                StoredMessage {
                    message_id: message.message_id,
                    message_type: message.message_type.clone(),
                    json_data: message.json_data.clone(),
                    json_metadata: message.json_metadata.clone(),
                    created_at: now,
                    position: next_position,
                },
            );
            stream.next_version += 1;
            log_entries.push((next_position, version));
            next_position += 1;
        }

        let head = stream.head();
        for (position, version) in log_entries {
            state.log.insert(position, (stream_id.clone(), version));
        }
        state.next_position = next_position;

        Ok(CommitOutcome::Committed(head))
    }

    async fn get_metadata(&self, stream_id: &StreamId) -> StoreResult<Option<MetadataRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .map(|stream| stream.metadata))
    }

    async fn set_metadata(&self, stream_id: &StreamId, record: MetadataRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.streams.entry(stream_id.clone()).or_default().metadata = record;
        Ok(())
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let existed = state.streams.remove(stream_id).is_some();
        if existed {
            state.log.retain(|_, (id, _)| id != stream_id);
        }
        Ok(existed)
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let Some(stream) = state.streams.get_mut(stream_id) else {
            return Ok(false);
        };
        let Some((&version, message)) = stream
            .messages
            .iter()
            .find(|(_, message)| message.message_id == message_id)
        else {
            return Ok(false);
        };

        let position = message.position;
        stream.messages.remove(&version);
        state.log.remove(&position);
        Ok(true)
    }

    async fn delete_messages_before(
        &self,
        stream_id: &StreamId,
        version: u64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let Some(stream) = state.streams.get_mut(stream_id) else {
            return Ok(());
        };
        let purged: Vec<(u64, u64)> = stream
            .messages
            .range(..version)
            .map(|(&v, message)| (v, message.position))
            .collect();
        for (v, position) in purged {
            stream.messages.remove(&v);
            state.log.remove(&position);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_store::NewMessage;

    fn message() -> NewMessage {
        NewMessage::new(Uuid::new_v4(), "test", "{}")
    }

    #[tokio::test]
    async fn positions_are_never_reused() {
        let adaptor = MemoryAdaptor::new();
        let stream_id = StreamId::from("s");

        let outcome = adaptor
            .commit_append(
                &stream_id,
                AppendCondition::NoStream,
                &[message(), message()],
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Committed(StreamHead::At { version: 1, position: 1 })
        ));

        let rows = adaptor
            .read_stream(&stream_id, 0, 10, ReadDirection::Forward, false)
            .await
            .unwrap();
        let last_id = rows[1].message_id;
        assert!(adaptor.delete_message(&stream_id, last_id).await.unwrap());

        adaptor
            .commit_append(&stream_id, AppendCondition::Always, &[message()])
            .await
            .unwrap();

        let head = adaptor.stream_head(&stream_id).await.unwrap();
        assert_eq!(
            head,
            StreamHead::At {
                version: 2,
                position: 2
            }
        );
    }

    #[tokio::test]
    async fn version_mismatch_writes_nothing() {
        let adaptor = MemoryAdaptor::new();
        let stream_id = StreamId::from("s");

        adaptor
            .commit_append(&stream_id, AppendCondition::NoStream, &[message()])
            .await
            .unwrap();

        let outcome = adaptor
            .commit_append(&stream_id, AppendCondition::AtVersion(5), &[message()])
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::VersionMismatch(_)));
        assert_eq!(adaptor.message_count(&stream_id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn deleting_a_stream_leaves_gaps_in_the_log() {
        let adaptor = MemoryAdaptor::new();

        adaptor
            .commit_append(&StreamId::from("a"), AppendCondition::NoStream, &[message()])
            .await
            .unwrap();
        adaptor
            .commit_append(&StreamId::from("b"), AppendCondition::NoStream, &[message()])
            .await
            .unwrap();
        adaptor
            .commit_append(&StreamId::from("a"), AppendCondition::Always, &[message()])
            .await
            .unwrap();

        assert!(adaptor.delete_stream(&StreamId::from("a")).await.unwrap());

        let rows = adaptor
            .read_all(0, 10, ReadDirection::Forward, false)
            .await
            .unwrap();
        let positions: Vec<u64> = rows.iter().map(|row| row.position).collect();
        assert_eq!(positions, vec![1]);

        assert_eq!(adaptor.head_position().await.unwrap(), Some(1));
    }
}
