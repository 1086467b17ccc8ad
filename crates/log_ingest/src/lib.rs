#![forbid(unsafe_code)]
//! Checkpointed ingestion of container and process logs.
//!
//! A [`Pipeline`] reads lines from a [`LogSource`], classifies each one with a
//! [`LineClassifier`](log_events::LineClassifier), appends the record to a
//! [`LogStore`] and then advances the store's checkpoint. Restarting against
//! the same store resumes from that checkpoint.
//!
//! ```no_run
//! use log_ingest::{IngestConfig, Pipeline, SqliteStore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IngestConfig::load("log-ingest.toml")?;
//! let store = SqliteStore::open(&config.database)?;
//! let mut pipeline = Pipeline::from_config(store, &config)?;
//! let summary = pipeline.ingest(&config.source, CancellationToken::new()).await?;
//! println!("stored {} lines", summary.stats.lines_read - summary.stats.failed);
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod error;
mod pipeline;
mod source;
mod store;

pub use checkpoint::CheckpointManager;
pub use config::{IngestConfig, DEFAULT_DATABASE};
pub use error::{
    ConfigError, IngestError, ReaderConfigError, SourceError, SourceSpecError, StorageError,
};
pub use pipeline::{IngestStats, Pipeline, RunSummary, StopReason};
pub use source::{
    LogSource, RawLine, ReaderConfig, SourceSpec, COMPOSE_IDENTITY, DEFAULT_DOCKER_PROGRAM,
    STDIN_IDENTITY,
};
pub use store::{LogStore, SqliteStore, STRUCTURED_TABLE, UNSTRUCTURED_TABLE};
