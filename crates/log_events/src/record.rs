use serde_json::{Map, Value};

use crate::Timestamp;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordKind {
    Structured,
    Unstructured,
}

/// A log line that parsed as a JSON object carrying event/level markers.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredLogRecord {
    /// Ingestion time. Producer-supplied timestamps are discarded.
    pub timestamp: Timestamp,
    pub service: String,
    pub log_level: String,
    pub message: String,
    /// Empty when the producer did not send one.
    pub correlation_id: String,
    pub caller_module: Option<String>,
    pub caller_function: Option<String>,
    pub filename: Option<String>,
    pub func_name: Option<String>,
    pub lineno: Option<i64>,
    /// Size-capped; `{}` when absent.
    pub function_kwargs: Value,
    /// Every raw key outside [`KNOWN_FIELDS`](crate::KNOWN_FIELDS) and the marker keys.
    pub custom_fields: Map<String, Value>,
}

/// A log line stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstructuredLogRecord {
    pub timestamp: Timestamp,
    pub source: String,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Structured(StructuredLogRecord),
    Unstructured(UnstructuredLogRecord),
}

impl LogRecord {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            LogRecord::Structured(record) => record.timestamp,
            LogRecord::Unstructured(record) => record.timestamp,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Structured(_) => RecordKind::Structured,
            LogRecord::Unstructured(_) => RecordKind::Unstructured,
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredLogRecord> {
        match self {
            LogRecord::Structured(record) => Some(record),
            LogRecord::Unstructured(_) => None,
        }
    }

    pub fn as_unstructured(&self) -> Option<&UnstructuredLogRecord> {
        match self {
            LogRecord::Structured(_) => None,
            LogRecord::Unstructured(record) => Some(record),
        }
    }
}
