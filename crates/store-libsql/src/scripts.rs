//! SQL statements, expanded once for the configured table prefix.

static CREATE_SCHEMA_SQL: &str = include_str!("../sql/create_schema.sql");
static DROP_ALL_SQL: &str = include_str!("../sql/drop_all.sql");

const PREFIX_TOKEN: &str = "__PREFIX__";

/// Statement set for one table prefix. The prefix is the only text
/// ever spliced into a statement; every value binds as a parameter.
#[derive(Debug, Clone)]
pub(crate) struct Scripts {
    pub create_schema: String,
    pub drop_all: String,
    pub insert_schema_version: String,
    pub get_schema_version: String,
    pub head_position: String,
    pub get_stream: String,
    pub stream_head: String,
    pub message_count: String,
    pub read_all_forward: String,
    pub read_all_backward: String,
    pub read_stream_forward: String,
    pub read_stream_backward: String,
    pub load_payload: String,
    pub message_ids: String,
    pub insert_stream: String,
    pub insert_message: String,
    pub update_next_version: String,
    pub get_metadata: String,
    pub set_metadata: String,
    pub delete_stream_messages: String,
    pub delete_stream: String,
    pub delete_message: String,
    pub delete_messages_before: String,
}

impl Scripts {
    pub(crate) fn new(prefix: &str) -> Self {
        let read_all = |comparison: &str, order: &str| {
            format!(
                "SELECT s.id, s.max_age_secs, s.max_count, m.stream_version, m.position, \
                        m.message_id, m.created_utc, m.type, m.json_metadata, \
                        CASE WHEN ?3 THEN m.json_data END \
                   FROM {prefix}_messages m \
                   JOIN {prefix}_streams s ON m.stream_id_internal = s.id_internal \
                  WHERE m.position {comparison} ?1 \
                  ORDER BY m.position {order} \
                  LIMIT ?2"
            )
        };
        let read_stream = |comparison: &str, order: &str| {
            format!(
                "SELECT s.id, s.max_age_secs, s.max_count, m.stream_version, m.position, \
                        m.message_id, m.created_utc, m.type, m.json_metadata, \
                        CASE WHEN ?4 THEN m.json_data END \
                   FROM {prefix}_messages m \
                   JOIN {prefix}_streams s ON m.stream_id_internal = s.id_internal \
                  WHERE s.id = ?1 AND m.stream_version {comparison} ?2 \
                  ORDER BY m.stream_version {order} \
                  LIMIT ?3"
            )
        };

        Self {
            create_schema: CREATE_SCHEMA_SQL.replace(PREFIX_TOKEN, prefix),
            drop_all: DROP_ALL_SQL.replace(PREFIX_TOKEN, prefix),
            insert_schema_version: format!(
                "INSERT OR IGNORE INTO {prefix}_schema_version (id, version) VALUES (1, ?1)"
            ),
            get_schema_version: format!(
                "SELECT version FROM {prefix}_schema_version WHERE id = 1"
            ),
            head_position: format!("SELECT MAX(position) FROM {prefix}_messages"),
            get_stream: format!(
                "SELECT id_internal, next_version FROM {prefix}_streams WHERE id = ?1"
            ),
            stream_head: format!(
                "SELECT stream_version, position FROM {prefix}_messages \
                  WHERE stream_id_internal = ?1 \
                  ORDER BY stream_version DESC LIMIT 1"
            ),
            message_count: format!(
                "SELECT COUNT(*) FROM {prefix}_messages WHERE stream_id_internal = ?1"
            ),
            read_all_forward: read_all(">=", "ASC"),
            read_all_backward: read_all("<=", "DESC"),
            read_stream_forward: read_stream(">=", "ASC"),
            read_stream_backward: read_stream("<=", "DESC"),
            load_payload: format!(
                "SELECT m.json_data FROM {prefix}_messages m \
                   JOIN {prefix}_streams s ON m.stream_id_internal = s.id_internal \
                  WHERE s.id = ?1 AND m.stream_version = ?2"
            ),
            message_ids: format!(
                "SELECT m.message_id FROM {prefix}_messages m \
                   JOIN {prefix}_streams s ON m.stream_id_internal = s.id_internal \
                  WHERE s.id = ?1 AND m.stream_version >= ?2 \
                  ORDER BY m.stream_version ASC \
                  LIMIT ?3"
            ),
            insert_stream: format!("INSERT INTO {prefix}_streams (id) VALUES (?1)"),
            insert_message: format!(
                "INSERT INTO {prefix}_messages \
                   (stream_id_internal, stream_version, message_id, created_utc, type, \
                    json_data, json_metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            update_next_version: format!(
                "UPDATE {prefix}_streams SET next_version = ?2 WHERE id_internal = ?1"
            ),
            get_metadata: format!(
                "SELECT max_age_secs, max_count FROM {prefix}_streams WHERE id = ?1"
            ),
            set_metadata: format!(
                "UPDATE {prefix}_streams SET max_age_secs = ?2, max_count = ?3 WHERE id = ?1"
            ),
            delete_stream_messages: format!(
                "DELETE FROM {prefix}_messages WHERE stream_id_internal = ?1"
            ),
            delete_stream: format!("DELETE FROM {prefix}_streams WHERE id_internal = ?1"),
            delete_message: format!(
                "DELETE FROM {prefix}_messages \
                  WHERE stream_id_internal = ?1 AND message_id = ?2"
            ),
            delete_messages_before: format!(
                "DELETE FROM {prefix}_messages \
                  WHERE stream_id_internal = ?1 AND stream_version < ?2"
            ),
        }
    }

    /// Individual statements of a multi-statement script.
    pub(crate) fn statements(script: &str) -> impl Iterator<Item = &str> {
        script
            .split(';')
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
    }
}
