use std::path::{Path, PathBuf};

use log_events::{StructuredLogRecord, Timestamp, UnstructuredLogRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::debug;

use super::schema::{self, CHECKPOINT_TABLE, STRUCTURED_TABLE, UNSTRUCTURED_TABLE};
use super::LogStore;
use crate::StorageError;

/// SQLite-backed [`LogStore`].
///
/// Opening a store creates missing tables, evolves the structured table to the
/// current column set, and imports a legacy checkpoint if the slot is empty.
/// Each append is a single `INSERT`, so a record lands atomically.
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "opening log store");

        let conn = Connection::open(&path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;

        Self::initialize(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|source| StorageError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::initialize(conn, None)
    }

    fn initialize(conn: Connection, path: Option<PathBuf>) -> Result<Self, StorageError> {
        let mut store = Self { conn, path };
        schema::create_tables(&store.conn)?;
        store.evolve_schema()?;
        schema::create_indexes(&store.conn)?;
        schema::import_legacy_checkpoint(&store.conn)?;
        Ok(store)
    }

    /// Database file backing this store; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Adds any structured-record columns missing from the persisted table and
    /// returns their names. Idempotent.
    pub fn evolve_schema(&mut self) -> Result<Vec<&'static str>, StorageError> {
        schema::evolve(&mut self.conn)
    }

    /// Column names of `table`, in declaration order.
    pub fn columns(&self, table: &str) -> Result<Vec<String>, StorageError> {
        schema::table_columns(&self.conn, table)
    }

    pub fn count_structured(&self) -> Result<u64, StorageError> {
        self.count(STRUCTURED_TABLE)
    }

    pub fn count_unstructured(&self) -> Result<u64, StorageError> {
        self.count(UNSTRUCTURED_TABLE)
    }

    fn count(&self, table: &'static str) -> Result<u64, StorageError> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
            .map_err(|source| StorageError::Read { table, source })
    }

    /// All structured records in insertion order.
    pub fn structured_records(&self) -> Result<Vec<StructuredLogRecord>, StorageError> {
        let table = STRUCTURED_TABLE;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT timestamp, service, log_level, message, correlation_id, caller_module,
                        caller_function, filename, func_name, lineno, function_kwargs, custom_fields
                 FROM {table} ORDER BY id"
            ))
            .map_err(|source| StorageError::Read { table, source })?;
        let rows = stmt
            .query_map([], StructuredRow::from_row)
            .map_err(|source| StorageError::Read { table, source })?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StorageError::Read { table, source })?;
        rows.into_iter().map(StructuredRow::into_record).collect()
    }

    /// All unstructured records in insertion order.
    pub fn unstructured_records(&self) -> Result<Vec<UnstructuredLogRecord>, StorageError> {
        let table = UNSTRUCTURED_TABLE;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT timestamp, source, log FROM {table} ORDER BY id"
            ))
            .map_err(|source| StorageError::Read { table, source })?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|source| StorageError::Read { table, source })?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StorageError::Read { table, source })?;

        rows.into_iter()
            .map(|(timestamp, source, log)| {
                Ok(UnstructuredLogRecord {
                    timestamp: decode_timestamp(timestamp)?,
                    source: source.unwrap_or_default(),
                    log: log.unwrap_or_default(),
                })
            })
            .collect()
    }
}

impl LogStore for SqliteStore {
    fn append_structured(&mut self, record: &StructuredLogRecord) -> Result<(), StorageError> {
        let function_kwargs = serde_json::to_string(&record.function_kwargs).map_err(|source| {
            StorageError::Encode {
                column: "function_kwargs",
                source,
            }
        })?;
        let custom_fields = serde_json::to_string(&record.custom_fields).map_err(|source| {
            StorageError::Encode {
                column: "custom_fields",
                source,
            }
        })?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {STRUCTURED_TABLE} (
                        timestamp, service, log_level, message, correlation_id, caller_module,
                        caller_function, filename, func_name, lineno, function_kwargs, custom_fields
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.timestamp.to_rfc3339(),
                    record.service,
                    record.log_level,
                    record.message,
                    record.correlation_id,
                    record.caller_module,
                    record.caller_function,
                    record.filename,
                    record.func_name,
                    record.lineno,
                    function_kwargs,
                    custom_fields,
                ],
            )
            .map_err(|source| StorageError::Write {
                table: STRUCTURED_TABLE,
                source,
            })?;
        Ok(())
    }

    fn append_unstructured(
        &mut self,
        record: &UnstructuredLogRecord,
    ) -> Result<(), StorageError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {UNSTRUCTURED_TABLE} (timestamp, source, log) VALUES (?1, ?2, ?3)"
                ),
                params![record.timestamp.to_rfc3339(), record.source, record.log],
            )
            .map_err(|source| StorageError::Write {
                table: UNSTRUCTURED_TABLE,
                source,
            })?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<Option<Timestamp>, StorageError> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT last_processed_timestamp FROM {CHECKPOINT_TABLE} WHERE id = 1"),
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| StorageError::CheckpointRead { source })?;

        match raw.flatten() {
            Some(raw) => Timestamp::parse(&raw)
                .map(Some)
                .map_err(|source| StorageError::InvalidCheckpoint { source }),
            None => Ok(None),
        }
    }

    fn set_checkpoint(&mut self, timestamp: Timestamp) -> Result<(), StorageError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {CHECKPOINT_TABLE} (id, last_processed_timestamp) VALUES (1, ?1)
                     ON CONFLICT(id) DO UPDATE SET last_processed_timestamp = excluded.last_processed_timestamp"
                ),
                [timestamp.to_rfc3339()],
            )
            .map_err(|source| StorageError::CheckpointWrite { source })?;
        Ok(())
    }
}

struct StructuredRow {
    timestamp: Option<String>,
    service: Option<String>,
    log_level: Option<String>,
    message: Option<String>,
    correlation_id: Option<String>,
    caller_module: Option<String>,
    caller_function: Option<String>,
    filename: Option<String>,
    func_name: Option<String>,
    lineno: Option<i64>,
    function_kwargs: Option<String>,
    custom_fields: Option<String>,
}

impl StructuredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            service: row.get(1)?,
            log_level: row.get(2)?,
            message: row.get(3)?,
            correlation_id: row.get(4)?,
            caller_module: row.get(5)?,
            caller_function: row.get(6)?,
            filename: row.get(7)?,
            func_name: row.get(8)?,
            lineno: row.get(9)?,
            function_kwargs: row.get(10)?,
            custom_fields: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<StructuredLogRecord, StorageError> {
        let function_kwargs = match self.function_kwargs {
            Some(raw) => decode_json("function_kwargs", &raw)?,
            None => Value::Object(Map::new()),
        };
        let custom_fields = match self.custom_fields {
            Some(raw) => match decode_json("custom_fields", &raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(StorageError::Decode {
                        column: "custom_fields",
                        reason: format!("expected a JSON object, found `{other}`"),
                    })
                }
            },
            None => Map::new(),
        };

        Ok(StructuredLogRecord {
            timestamp: decode_timestamp(self.timestamp)?,
            service: self.service.unwrap_or_default(),
            log_level: self.log_level.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
            correlation_id: self.correlation_id.unwrap_or_default(),
            caller_module: self.caller_module,
            caller_function: self.caller_function,
            filename: self.filename,
            func_name: self.func_name,
            lineno: self.lineno,
            function_kwargs,
            custom_fields,
        })
    }
}

fn decode_json(column: &'static str, raw: &str) -> Result<Value, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Decode {
        column,
        reason: err.to_string(),
    })
}

fn decode_timestamp(raw: Option<String>) -> Result<Timestamp, StorageError> {
    let raw = raw.ok_or_else(|| StorageError::Decode {
        column: "timestamp",
        reason: "missing".to_string(),
    })?;
    Timestamp::parse(&raw).map_err(|err| StorageError::Decode {
        column: "timestamp",
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn ts(raw: &str) -> Timestamp {
        Timestamp::parse(raw).unwrap()
    }

    fn structured(message: &str) -> StructuredLogRecord {
        let mut custom_fields = Map::new();
        custom_fields.insert("request_id".into(), json!("r-1"));
        StructuredLogRecord {
            timestamp: ts("2024-01-01T00:00:01Z"),
            service: "api".into(),
            log_level: "info".into(),
            message: message.into(),
            correlation_id: "c-1".into(),
            caller_module: None,
            caller_function: None,
            filename: Some("app.py".into()),
            func_name: Some("handle".into()),
            lineno: Some(12),
            function_kwargs: json!({"user": "u-1"}),
            custom_fields,
        }
    }

    #[test]
    fn appends_and_reads_back_both_kinds() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.append_structured(&structured("hello")).unwrap();
        store
            .append_unstructured(&UnstructuredLogRecord {
                timestamp: ts("2024-01-01T00:00:02Z"),
                source: "worker-1".into(),
                log: "plain".into(),
            })
            .unwrap();

        assert_eq!(store.count_structured().unwrap(), 1);
        assert_eq!(store.count_unstructured().unwrap(), 1);
        assert_eq!(store.structured_records().unwrap(), vec![structured("hello")]);
        let unstructured = store.unstructured_records().unwrap();
        assert_eq!(unstructured[0].source, "worker-1");
        assert_eq!(unstructured[0].log, "plain");
    }

    #[test]
    fn checkpoint_is_a_single_replaced_row() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.checkpoint().unwrap(), None);

        store.set_checkpoint(ts("2024-01-01T00:00:00Z")).unwrap();
        store.set_checkpoint(ts("2024-01-02T00:00:00Z")).unwrap();
        assert_eq!(store.checkpoint().unwrap(), Some(ts("2024-01-02T00:00:00Z")));

        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM checkpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn evolution_is_idempotent() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let before = store.columns(STRUCTURED_TABLE).unwrap();
        assert!(store.evolve_schema().unwrap().is_empty());
        assert!(store.evolve_schema().unwrap().is_empty());
        assert_eq!(store.columns(STRUCTURED_TABLE).unwrap(), before);
    }

    #[test]
    fn reopening_a_file_keeps_rows_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.append_structured(&structured("persisted")).unwrap();
            store.set_checkpoint(ts("2024-01-01T00:00:01Z")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(store.count_structured().unwrap(), 1);
        assert_eq!(store.checkpoint().unwrap(), Some(ts("2024-01-01T00:00:01Z")));
    }

    #[test]
    fn corrupt_checkpoint_is_reported() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO checkpoint (id, last_processed_timestamp) VALUES (1, 'soon')",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.checkpoint(),
            Err(StorageError::InvalidCheckpoint { .. })
        ));
        store.set_checkpoint(ts("2024-01-01T00:00:00Z")).unwrap();
        assert!(store.checkpoint().unwrap().is_some());
    }
}
