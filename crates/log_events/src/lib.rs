#![forbid(unsafe_code)]
//! Record model and line classification for ingested container logs.
//!
//! This crate performs no I/O. It provides:
//! - The two record kinds persisted by the ingestion pipeline
//!   ([`StructuredLogRecord`] and [`UnstructuredLogRecord`]).
//! - A [`LineClassifier`] that turns exactly one raw line into exactly one record.
//! - The recovered-error taxonomy ([`MalformedLine`], [`FieldTooLarge`]) reported
//!   alongside each classification.

mod classify;
mod config;
mod error;
mod record;
mod timestamp;

pub use classify::{cap_json, Classified, LineClassifier, KNOWN_FIELDS};
pub use config::ClassifierConfig;
pub use error::{ClassifierConfigError, FieldTooLarge, MalformedLine, TimestampParseError};
pub use record::{LogRecord, RecordKind, StructuredLogRecord, UnstructuredLogRecord};
pub use timestamp::Timestamp;
