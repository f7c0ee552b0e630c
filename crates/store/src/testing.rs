//! Shared fake adaptor for unit tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::adaptor::{
    Adaptor, AppendCondition, CommitOutcome, MessageRow, MetadataRecord, StreamHead,
};
use crate::error::{StoreError, StoreResult};
use crate::message::{NewMessage, StreamId};
use crate::position::ReadDirection;

/// In-memory fake with canned rows, call counters, and a failure
/// switch for exercising error paths.
#[derive(Default)]
pub(crate) struct FakeAdaptor {
    pub rows: Mutex<Vec<MessageRow>>,
    pub metadata: Mutex<Option<MetadataRecord>>,
    pub metadata_fetches: AtomicUsize,
    pub metadata_fetch_delay: Option<Duration>,
    pub fail_reads: AtomicBool,
}

impl FakeAdaptor {
    pub fn with_positions(stream_id: &str, positions: &[u64]) -> Self {
        let rows = positions
            .iter()
            .enumerate()
            .map(|(version, &position)| MessageRow {
                stream_id: StreamId::from(stream_id),
                max_age: None,
                max_count: None,
                stream_version: version as u64,
                position,
                message_id: Uuid::new_v4(),
                created_at: Utc::now(),
                message_type: "test".to_string(),
                json_metadata: None,
                json_data: Some("{}".to_string()),
            })
            .collect();

        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    fn guard_reads(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::backend("injected read failure"));
        }
        Ok(())
    }

    fn page(
        mut rows: Vec<MessageRow>,
        from: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
        key: impl Fn(&MessageRow) -> u64,
    ) -> Vec<MessageRow> {
        match direction {
            ReadDirection::Forward => {
                rows.retain(|r| key(r) >= from);
                rows.sort_by_key(&key);
            }
            ReadDirection::Backward => {
                rows.retain(|r| key(r) <= from);
                rows.sort_by_key(&key);
                rows.reverse();
            }
        }
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        if !prefetch {
            for row in &mut rows {
                row.json_data = None;
            }
        }
        rows
    }
}

#[async_trait]
impl Adaptor for FakeAdaptor {
    async fn create_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn drop_all(&self) -> StoreResult<()> {
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    async fn schema_version(&self) -> StoreResult<Option<u32>> {
        Ok(Some(crate::schema::CURRENT_SCHEMA_VERSION))
    }

    async fn head_position(&self) -> StoreResult<Option<u64>> {
        self.guard_reads()?;
        Ok(self.rows.lock().unwrap().iter().map(|r| r.position).max())
    }

    async fn stream_head(&self, stream_id: &StreamId) -> StoreResult<StreamHead> {
        self.guard_reads()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| r.stream_id == *stream_id)
            .max_by_key(|r| r.stream_version)
            .map_or(StreamHead::NotFound, |r| StreamHead::At {
                version: r.stream_version,
                position: r.position,
            }))
    }

    async fn message_count(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        let rows = self.rows.lock().unwrap();
        let count = rows.iter().filter(|r| r.stream_id == *stream_id).count() as u64;
        Ok((count > 0).then_some(count))
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        self.guard_reads()?;
        let rows = self.rows.lock().unwrap().clone();
        Ok(Self::page(rows, from_position, limit, direction, prefetch, |r| r.position))
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        self.guard_reads()?;
        let mut rows = self.rows.lock().unwrap().clone();
        rows.retain(|r| r.stream_id == *stream_id);
        Ok(Self::page(rows, from_version, limit, direction, prefetch, |r| {
            r.stream_version
        }))
    }

    async fn load_payload(
        &self,
        stream_id: &StreamId,
        stream_version: u64,
    ) -> StoreResult<Option<String>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| r.stream_id == *stream_id && r.stream_version == stream_version)
            .and_then(|r| r.json_data.clone()))
    }

    async fn message_ids(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
    ) -> StoreResult<Vec<Uuid>> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.retain(|r| r.stream_id == *stream_id && r.stream_version >= from_version);
        rows.sort_by_key(|r| r.stream_version);
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows.into_iter().map(|r| r.message_id).collect())
    }

    async fn commit_append(
        &self,
        stream_id: &StreamId,
        _condition: AppendCondition,
        new_rows: &[NewMessage],
    ) -> StoreResult<CommitOutcome> {
        let mut rows = self.rows.lock().unwrap();
        let next_version = rows
            .iter()
            .filter(|r| r.stream_id == *stream_id)
            .map(|r| r.stream_version + 1)
            .max()
            .unwrap_or(0);
        let mut next_position = rows.iter().map(|r| r.position + 1).max().unwrap_or(0);

        let mut head = StreamHead::Empty;
        for (i, message) in new_rows.iter().enumerate() {
            let version = next_version + i as u64;
            rows.push(MessageRow {
                stream_id: stream_id.clone(),
                max_age: None,
                max_count: None,
                stream_version: version,
                position: next_position,
                message_id: message.message_id,
                created_at: Utc::now(),
                message_type: message.message_type.clone(),
                json_metadata: message.json_metadata.clone(),
                json_data: Some(message.json_data.clone()),
            });
            head = StreamHead::At {
                version,
                position: next_position,
            };
            next_position += 1;
        }

        Ok(CommitOutcome::Committed(head))
    }

    async fn get_metadata(&self, _stream_id: &StreamId) -> StoreResult<Option<MetadataRecord>> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.metadata_fetch_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(*self.metadata.lock().unwrap())
    }

    async fn set_metadata(&self, _stream_id: &StreamId, record: MetadataRecord) -> StoreResult<()> {
        *self.metadata.lock().unwrap() = Some(record);
        Ok(())
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| r.stream_id != *stream_id);
        Ok(rows.len() != before)
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> StoreResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| !(r.stream_id == *stream_id && r.message_id == message_id));
        Ok(rows.len() != before)
    }

    async fn delete_messages_before(
        &self,
        stream_id: &StreamId,
        version: u64,
    ) -> StoreResult<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|r| !(r.stream_id == *stream_id && r.stream_version < version));
        Ok(())
    }
}
