use std::{path::PathBuf, process::ExitStatus};

use log_events::{ClassifierConfigError, TimestampParseError};
use thiserror::Error;

/// The external log source could not be started or attached to.
///
/// Fatal for a run; the core does not retry.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("log source `{program}` could not be spawned: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("container discovery via `{program}` failed with {status}: {stderr}")]
    Discover {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
    #[error("container discovery found no running containers")]
    NoContainers,
    #[error("log source `{program}` stdout unavailable")]
    StdoutUnavailable { program: PathBuf },
    #[error("log source `{program}` stderr unavailable")]
    StderrUnavailable { program: PathBuf },
    /// The process ended unsuccessfully before producing any log line.
    #[error("log source `{program}` exited with {status} without output: {stderr}")]
    Exited {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
}

/// A `[source]` table that cannot describe a runnable source.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SourceSpecError {
    #[error("source.program must not be empty")]
    EmptyProgram,
    #[error("source.identity must not be empty")]
    EmptyIdentity,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReaderConfigError {
    #[error("reader.max_line_bytes must be greater than zero")]
    ZeroMaxLineBytes,
    #[error("reader.channel_capacity must be greater than zero")]
    ZeroChannelCapacity,
}

/// Failures of the durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open log store at `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to prepare log store schema: {source}")]
    Schema {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to append to `{table}`: {source}")]
    Write {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to encode `{column}` as JSON: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read `{table}`: {source}")]
    Read {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("stored `{column}` value could not be decoded: {reason}")]
    Decode { column: &'static str, reason: String },
    #[error("failed to read checkpoint: {source}")]
    CheckpointRead {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to write checkpoint: {source}")]
    CheckpointWrite {
        #[source]
        source: rusqlite::Error,
    },
    #[error("stored checkpoint is invalid: {source}")]
    InvalidCheckpoint {
        #[source]
        source: TimestampParseError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: database must not be empty")]
    EmptyDatabase,
    #[error("invalid config: {0}")]
    Source(#[from] SourceSpecError),
    #[error("invalid config: {0}")]
    Classifier(#[from] ClassifierConfigError),
    #[error("invalid config: {0}")]
    Reader(#[from] ReaderConfigError),
}

/// Top-level error for starting an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
