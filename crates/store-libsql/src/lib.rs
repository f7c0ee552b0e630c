//! SQLite storage adaptor built on
//! [libsql](https://github.com/tursodatabase/libsql).
//!
//! Messages live in an `AUTOINCREMENT` table, so physical positions
//! are 1-based and never reused; the adaptor converts them to the
//! store's 0-based logical positions. The embedded engine runs on one
//! connection, and operations serialize on it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod scripts;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, Transaction, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use scripts::Scripts;
use weir_store::adaptor::{
    Adaptor, AppendCondition, CommitOutcome, MessageRow, MetadataRecord, StreamHead,
};
use weir_store::{NewMessage, ReadDirection, StoreError, StoreResult, StreamId, ordinal};

/// Configuration for [`LibsqlAdaptor`].
#[derive(Debug, Clone)]
pub struct LibsqlConfig {
    /// Prefix for every table this adaptor creates. Must match
    /// `[A-Za-z_][A-Za-z0-9_]*`; it is the only text spliced into SQL.
    pub table_prefix: String,
}

impl Default for LibsqlConfig {
    fn default() -> Self {
        Self {
            table_prefix: "weir".to_string(),
        }
    }
}

fn is_safe_identifier(identifier: &str) -> bool {
    let mut chars = identifier.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn db_err(error: libsql::Error) -> StoreError {
    StoreError::backend(error.to_string())
}

/// SQLite storage adaptor.
#[derive(Clone)]
pub struct LibsqlAdaptor {
    connection: Connection,
    scripts: Arc<Scripts>,
    op_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for LibsqlAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibsqlAdaptor").finish()
    }
}

impl LibsqlAdaptor {
    /// Connects to the database at the given path (`:memory:` for an
    /// in-memory database).
    ///
    /// # Errors
    ///
    /// Returns an error if the table prefix fails validation or the
    /// connection cannot be established.
    pub async fn connect(
        path: impl AsRef<std::path::Path> + Send,
        config: LibsqlConfig,
    ) -> StoreResult<Self> {
        if !is_safe_identifier(&config.table_prefix) {
            return Err(StoreError::backend(format!(
                "invalid table prefix: {}",
                config.table_prefix
            )));
        }

        let connection = Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?
            .connect()
            .map_err(db_err)?;

        Ok(Self {
            connection,
            scripts: Arc::new(Scripts::new(&config.table_prefix)),
            op_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn stream_internal(&self, stream_id: &StreamId) -> StoreResult<Option<(i64, u64)>> {
        Self::stream_internal_on(&self.connection, &self.scripts, stream_id).await
    }

    /// Looks up a stream's internal id and version counter on the
    /// given connection (or open transaction).
    async fn stream_internal_on(
        connection: &Connection,
        scripts: &Scripts,
        stream_id: &StreamId,
    ) -> StoreResult<Option<(i64, u64)>> {
        let mut rows = connection
            .query(
                &scripts.get_stream,
                vec![Value::Text(stream_id.as_str().to_string())],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let id_internal = int_at(&row, 0)?;
                let next_version = u64_at(&row, 1)?;
                Ok(Some((id_internal, next_version)))
            }
            None => Ok(None),
        }
    }

    async fn stream_head_on(
        connection: &Connection,
        scripts: &Scripts,
        id_internal: i64,
    ) -> StoreResult<StreamHead> {
        let mut rows = connection
            .query(&scripts.stream_head, vec![Value::Integer(id_internal)])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(StreamHead::At {
                version: u64_at(&row, 0)?,
                position: ordinal::to_logical(u64_at(&row, 1)?),
            }),
            None => Ok(StreamHead::Empty),
        }
    }

    async fn read_rows(
        &self,
        statement: &str,
        params: Vec<Value>,
    ) -> StoreResult<Vec<MessageRow>> {
        let mut rows = self
            .connection
            .query(statement, params)
            .await
            .map_err(db_err)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            result.push(message_row(&row)?);
        }
        Ok(result)
    }
}

fn value_at(row: &Row, index: i32) -> StoreResult<Value> {
    row.get_value(index).map_err(db_err)
}

fn int_at(row: &Row, index: i32) -> StoreResult<i64> {
    match value_at(row, index)? {
        Value::Integer(value) => Ok(value),
        other => Err(StoreError::backend(format!(
            "expected integer column {index}, got {other:?}"
        ))),
    }
}

fn u64_at(row: &Row, index: i32) -> StoreResult<u64> {
    u64::try_from(int_at(row, index)?)
        .map_err(|_| StoreError::backend(format!("negative value in column {index}")))
}

fn opt_u64_at(row: &Row, index: i32) -> StoreResult<Option<u64>> {
    match value_at(row, index)? {
        Value::Null => Ok(None),
        Value::Integer(value) => u64::try_from(value).map(Some).map_err(|_| {
            StoreError::backend(format!("negative value in column {index}"))
        }),
        other => Err(StoreError::backend(format!(
            "expected integer column {index}, got {other:?}"
        ))),
    }
}

fn text_at(row: &Row, index: i32) -> StoreResult<String> {
    match value_at(row, index)? {
        Value::Text(value) => Ok(value),
        other => Err(StoreError::backend(format!(
            "expected text column {index}, got {other:?}"
        ))),
    }
}

fn opt_text_at(row: &Row, index: i32) -> StoreResult<Option<String>> {
    match value_at(row, index)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(StoreError::backend(format!(
            "expected text column {index}, got {other:?}"
        ))),
    }
}

fn timestamp_at(row: &Row, index: i32) -> StoreResult<DateTime<Utc>> {
    let text = text_at(row, index)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::backend(format!("bad timestamp {text}: {e}")))
}

fn uuid_at(row: &Row, index: i32) -> StoreResult<Uuid> {
    let text = text_at(row, index)?;
    Uuid::parse_str(&text).map_err(|e| StoreError::backend(format!("bad message id {text}: {e}")))
}

/// Reads the shared ten-column row shape of the page queries.
fn message_row(row: &Row) -> StoreResult<MessageRow> {
    Ok(MessageRow {
        stream_id: StreamId::from(text_at(row, 0)?),
        max_age: opt_u64_at(row, 1)?.map(std::time::Duration::from_secs),
        max_count: opt_u64_at(row, 2)?,
        stream_version: u64_at(row, 3)?,
        position: ordinal::to_logical(u64_at(row, 4)?),
        message_id: uuid_at(row, 5)?,
        created_at: timestamp_at(row, 6)?,
        message_type: text_at(row, 7)?,
        json_metadata: opt_text_at(row, 8)?,
        json_data: opt_text_at(row, 9)?,
    })
}

fn limit_value(limit: u64) -> Value {
    Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

fn position_value(logical: u64) -> StoreResult<Value> {
    if logical == u64::MAX {
        return Err(StoreError::backend("position out of range"));
    }
    i64::try_from(ordinal::to_physical(logical))
        .map(Value::Integer)
        .map_err(|_| StoreError::backend("position out of range"))
}

fn version_value(version: u64) -> StoreResult<Value> {
    i64::try_from(version)
        .map(Value::Integer)
        .map_err(|_| StoreError::backend("version out of range"))
}

async fn rollback(tx: Transaction) -> StoreResult<()> {
    tx.rollback().await.map_err(db_err)
}

#[async_trait]
impl Adaptor for LibsqlAdaptor {
    async fn create_schema(&self) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        for statement in Scripts::statements(&self.scripts.create_schema) {
            self.connection
                .execute(statement, Vec::<Value>::new())
                .await
                .map_err(db_err)?;
        }
        self.connection
            .execute(
                &self.scripts.insert_schema_version,
                vec![Value::Integer(i64::from(weir_store::CURRENT_SCHEMA_VERSION))],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn drop_all(&self) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        for statement in Scripts::statements(&self.scripts.drop_all) {
            self.connection
                .execute(statement, Vec::<Value>::new())
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn schema_version(&self) -> StoreResult<Option<u32>> {
        let _guard = self.op_lock.lock().await;

        let mut rows = match self
            .connection
            .query(&self.scripts.get_schema_version, Vec::<Value>::new())
            .await
        {
            Ok(rows) => rows,
            // A database without the version table is simply
            // unversioned, not broken.
            Err(error) if error.to_string().contains("no such table") => return Ok(None),
            Err(error) => return Err(db_err(error)),
        };

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let version = u32::try_from(int_at(&row, 0)?)
                    .map_err(|_| StoreError::backend("schema version out of range"))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    async fn head_position(&self) -> StoreResult<Option<u64>> {
        let _guard = self.op_lock.lock().await;

        let mut rows = self
            .connection
            .query(&self.scripts.head_position, Vec::<Value>::new())
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(opt_u64_at(&row, 0)?.map(ordinal::to_logical)),
            None => Ok(None),
        }
    }

    async fn stream_head(&self, stream_id: &StreamId) -> StoreResult<StreamHead> {
        let _guard = self.op_lock.lock().await;

        match self.stream_internal(stream_id).await? {
            Some((id_internal, _)) => {
                Self::stream_head_on(&self.connection, &self.scripts, id_internal).await
            }
            None => Ok(StreamHead::NotFound),
        }
    }

    async fn message_count(&self, stream_id: &StreamId) -> StoreResult<Option<u64>> {
        let _guard = self.op_lock.lock().await;

        let Some((id_internal, _)) = self.stream_internal(stream_id).await? else {
            return Ok(None);
        };

        let mut rows = self
            .connection
            .query(&self.scripts.message_count, vec![Value::Integer(id_internal)])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(u64_at(&row, 0)?)),
            None => Ok(Some(0)),
        }
    }

    async fn read_all(
        &self,
        from_position: u64,
        limit: u64,
        direction: ReadDirection,
        prefetch: bool,
    ) -> StoreResult<Vec<MessageRow>> {
        let _guard = self.op_lock.lock().await;

        let statement = match direction {
            ReadDirection::Forward => &self.scripts.read_all_forward,
            ReadDirection::Backward => &self.scripts.read_all_backward,
        };
        self.read_rows(
            statement,
            vec![
                position_value(from_position)?,
                limit_value(limit),
                Value::Integer(i64::from(prefetch)),
            ],
        )
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
        let _guard = self.op_lock.lock().await;

        let statement = match direction {
            ReadDirection::Forward => &self.scripts.read_stream_forward,
            ReadDirection::Backward => &self.scripts.read_stream_backward,
        };
        self.read_rows(
            statement,
            vec![
                Value::Text(stream_id.as_str().to_string()),
                version_value(from_version)?,
                limit_value(limit),
                Value::Integer(i64::from(prefetch)),
            ],
        )
        .await
    }

    async fn load_payload(
        &self,
        stream_id: &StreamId,
        stream_version: u64,
    ) -> StoreResult<Option<String>> {
        let _guard = self.op_lock.lock().await;

        let mut rows = self
            .connection
            .query(
                &self.scripts.load_payload,
                vec![
                    Value::Text(stream_id.as_str().to_string()),
                    version_value(stream_version)?,
                ],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(text_at(&row, 0)?)),
            None => Ok(None),
        }
    }

    async fn message_ids(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        limit: u64,
    ) -> StoreResult<Vec<Uuid>> {
        let _guard = self.op_lock.lock().await;

        let mut rows = self
            .connection
            .query(
                &self.scripts.message_ids,
                vec![
                    Value::Text(stream_id.as_str().to_string()),
                    version_value(from_version)?,
                    limit_value(limit),
                ],
            )
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.push(uuid_at(&row, 0)?);
        }
        Ok(ids)
    }

    async fn commit_append(
        &self,
        stream_id: &StreamId,
        condition: AppendCondition,
        rows: &[NewMessage],
    ) -> StoreResult<CommitOutcome> {
        let _guard = self.op_lock.lock().await;

        let tx = self.connection.transaction().await.map_err(db_err)?;

        let stream = Self::stream_internal_on(&tx, &self.scripts, stream_id).await?;
        let head = match stream {
            Some((id_internal, _)) => {
                Self::stream_head_on(&tx, &self.scripts, id_internal).await?
            }
            None => StreamHead::NotFound,
        };

        let holds = match condition {
            AppendCondition::Always => true,
            AppendCondition::NoStream => stream.is_none(),
            AppendCondition::EmptyStream => head == StreamHead::Empty,
            AppendCondition::AtVersion(version) => head.version() == Some(version),
        };
        if !holds {
            rollback(tx).await?;
            return Ok(CommitOutcome::VersionMismatch(head));
        }

        let (id_internal, next_version) = match stream {
            Some(stream) => stream,
            None => {
                tx.execute(
                    &self.scripts.insert_stream,
                    vec![Value::Text(stream_id.as_str().to_string())],
                )
                .await
                .map_err(db_err)?;
                Self::stream_internal_on(&tx, &self.scripts, stream_id)
                    .await?
                    .ok_or_else(|| StoreError::backend("stream row vanished mid-transaction"))?
            }
        };

        let created_utc = Utc::now().to_rfc3339();
        for (offset, message) in rows.iter().enumerate() {
            let version = next_version + offset as u64;
            tx.execute(
                &self.scripts.insert_message,
                vec![
                    Value::Integer(id_internal),
                    version_value(version)?,
                    Value::Text(message.message_id.to_string()),
                    Value::Text(created_utc.clone()),
                    Value::Text(message.message_type.clone()),
                    Value::Text(message.json_data.clone()),
                    message
                        .json_metadata
                        .clone()
                        .map_or(Value::Null, Value::Text),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        if !rows.is_empty() {
            tx.execute(
                &self.scripts.update_next_version,
                vec![
                    Value::Integer(id_internal),
                    version_value(next_version + rows.len() as u64)?,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        let head = Self::stream_head_on(&tx, &self.scripts, id_internal).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(CommitOutcome::Committed(head))
    }

    async fn get_metadata(&self, stream_id: &StreamId) -> StoreResult<Option<MetadataRecord>> {
        let _guard = self.op_lock.lock().await;

        let mut rows = self
            .connection
            .query(
                &self.scripts.get_metadata,
                vec![Value::Text(stream_id.as_str().to_string())],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(MetadataRecord {
                max_age: opt_u64_at(&row, 0)?.map(std::time::Duration::from_secs),
                max_count: opt_u64_at(&row, 1)?,
            })),
            None => Ok(None),
        }
    }

    async fn set_metadata(&self, stream_id: &StreamId, record: MetadataRecord) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        if self.stream_internal(stream_id).await?.is_none() {
            self.connection
                .execute(
                    &self.scripts.insert_stream,
                    vec![Value::Text(stream_id.as_str().to_string())],
                )
                .await
                .map_err(db_err)?;
        }

        self.connection
            .execute(
                &self.scripts.set_metadata,
                vec![
                    Value::Text(stream_id.as_str().to_string()),
                    record.max_age.map_or(Value::Null, |age| {
                        Value::Integer(i64::try_from(age.as_secs()).unwrap_or(i64::MAX))
                    }),
                    record
                        .max_count
                        .map_or(Ok(Value::Null), |count| version_value(count))?,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> StoreResult<bool> {
        let _guard = self.op_lock.lock().await;

        let Some((id_internal, _)) = self.stream_internal(stream_id).await? else {
            return Ok(false);
        };

        let tx = self.connection.transaction().await.map_err(db_err)?;
        tx.execute(
            &self.scripts.delete_stream_messages,
            vec![Value::Integer(id_internal)],
        )
        .await
        .map_err(db_err)?;
        tx.execute(&self.scripts.delete_stream, vec![Value::Integer(id_internal)])
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(true)
    }

    async fn delete_message(&self, stream_id: &StreamId, message_id: Uuid) -> StoreResult<bool> {
        let _guard = self.op_lock.lock().await;

        let Some((id_internal, _)) = self.stream_internal(stream_id).await? else {
            return Ok(false);
        };

        let deleted = self
            .connection
            .execute(
                &self.scripts.delete_message,
                vec![
                    Value::Integer(id_internal),
                    Value::Text(message_id.to_string()),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    async fn delete_messages_before(
        &self,
        stream_id: &StreamId,
        version: u64,
    ) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        let Some((id_internal, _)) = self.stream_internal(stream_id).await? else {
            return Ok(());
        };

        self.connection
            .execute(
                &self.scripts.delete_messages_before,
                vec![Value::Integer(id_internal), version_value(version)?],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
