use log_events::{LineClassifier, RecordKind, Timestamp};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    CheckpointManager, IngestConfig, IngestError, LogSource, LogStore, RawLine, ReaderConfig,
    SourceError, SourceSpec, StorageError,
};

/// Why [`Pipeline::run`] returned.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    /// Every stream of the source ended.
    SourceExhausted,
    /// The shutdown token was cancelled.
    Cancelled,
}

/// Line counters for one run.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IngestStats {
    pub lines_read: u64,
    pub structured: u64,
    pub unstructured: u64,
    /// Lines whose record could not be stored.
    pub failed: u64,
    /// Lines stored as unstructured because they were not structured logs.
    pub malformed: u64,
    /// Records whose `function_kwargs` was replaced by a truncation sentinel.
    pub oversized: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RunSummary {
    pub stats: IngestStats,
    /// Checkpoint held by the store when the run ended.
    pub checkpoint: Option<Timestamp>,
    pub stop_reason: StopReason,
}

/// Sequential read, classify, store, checkpoint loop over one store.
pub struct Pipeline<S> {
    store: S,
    classifier: LineClassifier,
    checkpoints: CheckpointManager,
    reader: ReaderConfig,
    last_ingested: Option<Timestamp>,
    stats: IngestStats,
}

impl<S: LogStore> Pipeline<S> {
    /// Reads the store's checkpoint once; fails if it cannot be read.
    pub fn new(
        store: S,
        classifier: LineClassifier,
        reader: ReaderConfig,
    ) -> Result<Self, StorageError> {
        let checkpoints = CheckpointManager::load(&store)?;
        Ok(Self {
            store,
            classifier,
            last_ingested: checkpoints.resume_from(),
            checkpoints,
            reader,
            stats: IngestStats::default(),
        })
    }

    pub fn from_config(store: S, config: &IngestConfig) -> Result<Self, StorageError> {
        Self::new(
            store,
            LineClassifier::new(config.classifier.clone()),
            config.reader.clone(),
        )
    }

    /// Resume point handed to sources; `None` on a first run.
    pub fn resume_from(&self) -> Option<Timestamp> {
        self.checkpoints.resume_from()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Starts `spec`, asking it for output at or after the checkpoint.
    pub async fn start_source(&self, spec: &SourceSpec) -> Result<LogSource, SourceError> {
        if let Some(since) = self.resume_from() {
            info!(%since, "resuming from checkpoint");
        } else {
            info!("no checkpoint; reading all available output");
        }
        LogSource::start(spec, self.resume_from(), &self.reader).await
    }

    /// Starts `spec` and runs until it is exhausted or `shutdown` fires.
    pub async fn ingest(
        &mut self,
        spec: &SourceSpec,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, IngestError> {
        let source = self.start_source(spec).await?;
        self.run(source, shutdown).await
    }

    /// Classifies and stores one line, then advances the checkpoint to its
    /// ingestion time. A storage error leaves the checkpoint where it was.
    pub fn ingest_line(&mut self, raw: &RawLine) -> Result<RecordKind, StorageError> {
        self.stats.lines_read += 1;
        let ingested_at = self.next_timestamp();
        let classified = self.classifier.classify(&raw.line, &raw.source, ingested_at);

        if let Some(malformed) = &classified.malformed {
            self.stats.malformed += 1;
            debug!(source = %raw.source, kind = malformed.kind(), "stored line as unstructured");
        }
        if let Some(oversized) = &classified.oversized {
            self.stats.oversized += 1;
            warn!(
                source = %raw.source,
                field = oversized.field,
                observed_bytes = oversized.observed_bytes,
                max_bytes = oversized.max_bytes,
                "field exceeds size budget; stored truncation marker"
            );
        }

        let kind = classified.record.kind();
        if let Err(err) = self.store.append(&classified.record) {
            self.stats.failed += 1;
            return Err(err);
        }
        match kind {
            RecordKind::Structured => self.stats.structured += 1,
            RecordKind::Unstructured => self.stats.unstructured += 1,
        }

        if let Err(err) = self.checkpoints.commit(&mut self.store, ingested_at) {
            warn!(checkpoint = %ingested_at, error = %err, "checkpoint write failed; will retry");
        }
        Ok(kind)
    }

    /// Drains `source` until it ends or `shutdown` is cancelled. Storage
    /// faults are logged per line and never stop the loop; a source that
    /// fails stops it with an error after the checkpoint is flushed.
    pub async fn run(
        &mut self,
        mut source: LogSource,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, IngestError> {
        self.stats = IngestStats::default();

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(StopReason::Cancelled),
                next = source.recv() => next,
            };
            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => break Ok(StopReason::SourceExhausted),
                Err(err) => break Err(err),
            };
            if let Err(err) = self.ingest_line(&raw) {
                error!(
                    source = %raw.source,
                    error = %err,
                    failures = self.stats.failed,
                    "failed to store log line"
                );
            }
        };

        let unstored = source.lines_forwarded().saturating_sub(self.stats.lines_read);
        if unstored > 0 {
            warn!(unstored, "lines read from the source were not stored before stopping");
        }
        let checkpoint = self.checkpoints.flush(&mut self.store);
        source.shutdown().await;

        info!(
            lines_read = self.stats.lines_read,
            structured = self.stats.structured,
            unstructured = self.stats.unstructured,
            failed = self.stats.failed,
            malformed = self.stats.malformed,
            oversized = self.stats.oversized,
            checkpoint = ?checkpoint.map(|ts| ts.to_rfc3339()),
            stop_reason = ?outcome.as_ref().ok(),
            "ingestion run finished"
        );
        let stop_reason = match outcome {
            Ok(stop_reason) => stop_reason,
            Err(err) => {
                error!(error = %err, "log source failed");
                return Err(err.into());
            }
        };
        Ok(RunSummary {
            stats: self.stats,
            checkpoint,
            stop_reason,
        })
    }

    /// `now`, or just after the previous ingestion time when the clock has
    /// not moved past it, so ingestion timestamps strictly increase.
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let next = match self.last_ingested {
            Some(previous) if now <= previous => previous.successor(),
            _ => now,
        };
        self.last_ingested = Some(next);
        next
    }
}
