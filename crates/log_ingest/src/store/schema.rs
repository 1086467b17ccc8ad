//! Table layout and in-place schema evolution.

use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use log_events::Timestamp;

use crate::StorageError;

pub const STRUCTURED_TABLE: &str = "structured_logs";
pub const UNSTRUCTURED_TABLE: &str = "unstructured_logs";
pub(crate) const CHECKPOINT_TABLE: &str = "checkpoint";
/// History table written by earlier tooling: one appended row per run.
const LEGACY_CHECKPOINT_TABLE: &str = "timestamp";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Column {
    pub(crate) name: &'static str,
    pub(crate) sql_type: &'static str,
}

const fn column(name: &'static str, sql_type: &'static str) -> Column {
    Column { name, sql_type }
}

/// Current structured-record shape, in insert order. New fields are appended
/// here; `evolve` adds them to stores created before they existed.
pub(crate) const STRUCTURED_COLUMNS: &[Column] = &[
    column("timestamp", "TEXT"),
    column("service", "TEXT"),
    column("log_level", "TEXT"),
    column("message", "TEXT"),
    column("correlation_id", "TEXT"),
    column("caller_module", "TEXT"),
    column("caller_function", "TEXT"),
    column("filename", "TEXT"),
    column("func_name", "TEXT"),
    column("lineno", "INTEGER"),
    column("function_kwargs", "TEXT"),
    column("custom_fields", "TEXT"),
];

pub(crate) fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    let structured_columns = STRUCTURED_COLUMNS
        .iter()
        .map(|c| format!("{} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(",\n    ");

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {STRUCTURED_TABLE} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    {structured_columns}
);
CREATE TABLE IF NOT EXISTS {UNSTRUCTURED_TABLE} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT,
    source TEXT,
    log TEXT
);
CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_processed_timestamp TEXT
);
CREATE INDEX IF NOT EXISTS idx_{UNSTRUCTURED_TABLE}_timestamp ON {UNSTRUCTURED_TABLE}(timestamp);"
    );

    conn.execute_batch(&ddl)
        .map_err(|source| StorageError::Schema { source })
}

/// Indexes on evolvable columns are created after `evolve` so that older
/// stores have the column before the index references it.
pub(crate) fn create_indexes(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{STRUCTURED_TABLE}_timestamp ON {STRUCTURED_TABLE}(timestamp);
CREATE INDEX IF NOT EXISTS idx_{STRUCTURED_TABLE}_log_level ON {STRUCTURED_TABLE}(log_level);"
    ))
    .map_err(|source| StorageError::Schema { source })
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(|source| StorageError::Schema { source })?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(|source| StorageError::Schema { source })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StorageError::Schema { source })?;
    Ok(names)
}

/// Adds every column of [`STRUCTURED_COLUMNS`] missing from the persisted
/// table. Existing rows read the new columns as NULL. Running it against an
/// up-to-date store changes nothing.
pub(crate) fn evolve(conn: &mut Connection) -> Result<Vec<&'static str>, StorageError> {
    let tx = conn
        .transaction()
        .map_err(|source| StorageError::Schema { source })?;

    let existing = table_columns(&tx, STRUCTURED_TABLE)?;
    let mut added = Vec::new();
    for column in STRUCTURED_COLUMNS {
        if existing.iter().any(|name| name.eq_ignore_ascii_case(column.name)) {
            continue;
        }
        tx.execute_batch(&format!(
            "ALTER TABLE {STRUCTURED_TABLE} ADD COLUMN {} {}",
            column.name, column.sql_type
        ))
        .map_err(|source| StorageError::Schema { source })?;
        added.push(column.name);
    }

    tx.commit()
        .map_err(|source| StorageError::Schema { source })?;

    if !added.is_empty() {
        info!(table = STRUCTURED_TABLE, columns = ?added, "evolved log store schema");
    }
    Ok(added)
}

/// Seeds an empty checkpoint slot from the most recent row of the legacy
/// history table, when one exists.
pub(crate) fn import_legacy_checkpoint(conn: &Connection) -> Result<(), StorageError> {
    let has_slot: bool = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {CHECKPOINT_TABLE} WHERE id = 1)"),
            [],
            |row| row.get(0),
        )
        .map_err(|source| StorageError::CheckpointRead { source })?;
    if has_slot {
        return Ok(());
    }

    let has_legacy: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [LEGACY_CHECKPOINT_TABLE],
            |row| row.get(0),
        )
        .map_err(|source| StorageError::CheckpointRead { source })?;
    if !has_legacy {
        return Ok(());
    }

    let latest: Option<Option<String>> = conn
        .query_row(
            &format!(
                "SELECT last_processed FROM \"{LEGACY_CHECKPOINT_TABLE}\" ORDER BY id DESC LIMIT 1"
            ),
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| StorageError::CheckpointRead { source })?;
    let Some(Some(raw)) = latest else {
        return Ok(());
    };

    match Timestamp::parse(&raw) {
        Ok(timestamp) => {
            conn.execute(
                &format!(
                    "INSERT INTO {CHECKPOINT_TABLE} (id, last_processed_timestamp) VALUES (1, ?1)"
                ),
                [timestamp.to_rfc3339()],
            )
            .map_err(|source| StorageError::CheckpointWrite { source })?;
            info!(checkpoint = %timestamp, "imported checkpoint from legacy history table");
        }
        Err(err) => {
            warn!(value = %raw, error = %err, "ignoring unparsable legacy checkpoint");
        }
    }
    Ok(())
}
