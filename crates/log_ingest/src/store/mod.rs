mod schema;
mod sqlite;

use log_events::{LogRecord, StructuredLogRecord, Timestamp, UnstructuredLogRecord};

use crate::StorageError;

pub use schema::{STRUCTURED_TABLE, UNSTRUCTURED_TABLE};
pub use sqlite::SqliteStore;

/// Append-only persistence for both record kinds plus one checkpoint slot.
///
/// Every append either lands completely or returns an error; nothing is
/// partially written.
pub trait LogStore {
    fn append_structured(&mut self, record: &StructuredLogRecord) -> Result<(), StorageError>;

    fn append_unstructured(&mut self, record: &UnstructuredLogRecord)
        -> Result<(), StorageError>;

    fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        match record {
            LogRecord::Structured(record) => self.append_structured(record),
            LogRecord::Unstructured(record) => self.append_unstructured(record),
        }
    }

    /// Last committed checkpoint, or `None` if it was never set.
    fn checkpoint(&self) -> Result<Option<Timestamp>, StorageError>;

    /// Replaces the single checkpoint value.
    fn set_checkpoint(&mut self, timestamp: Timestamp) -> Result<(), StorageError>;
}
