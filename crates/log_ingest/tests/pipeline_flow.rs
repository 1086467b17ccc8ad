use std::time::Duration;

use log_events::{LineClassifier, StructuredLogRecord, Timestamp, UnstructuredLogRecord};
use log_ingest::{
    LogSource, LogStore, Pipeline, ReaderConfig, SqliteStore, StopReason, StorageError,
};
use rusqlite::ffi;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

fn disk_full() -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_FULL),
        Some("database or disk is full".to_string()),
    )
}

/// Delegates to SQLite but rejects selected writes.
struct FlakyStore {
    inner: SqliteStore,
    reject_logs_containing: &'static str,
    /// Checkpoint writes to reject before accepting again.
    checkpoint_failures: usize,
    /// Checkpoint writes to accept before rejecting every later one.
    checkpoint_writes_left: Option<usize>,
}

impl FlakyStore {
    fn new(reject_logs_containing: &'static str) -> Self {
        Self::wrap(
            SqliteStore::open_in_memory().expect("store"),
            reject_logs_containing,
        )
    }

    fn wrap(inner: SqliteStore, reject_logs_containing: &'static str) -> Self {
        Self {
            inner,
            reject_logs_containing,
            checkpoint_failures: 0,
            checkpoint_writes_left: None,
        }
    }
}

impl LogStore for FlakyStore {
    fn append_structured(&mut self, record: &StructuredLogRecord) -> Result<(), StorageError> {
        self.inner.append_structured(record)
    }

    fn append_unstructured(
        &mut self,
        record: &UnstructuredLogRecord,
    ) -> Result<(), StorageError> {
        if record.log.contains(self.reject_logs_containing) {
            return Err(StorageError::Write {
                table: "unstructured_logs",
                source: disk_full(),
            });
        }
        self.inner.append_unstructured(record)
    }

    fn checkpoint(&self) -> Result<Option<Timestamp>, StorageError> {
        self.inner.checkpoint()
    }

    fn set_checkpoint(&mut self, timestamp: Timestamp) -> Result<(), StorageError> {
        if self.checkpoint_failures > 0 {
            self.checkpoint_failures -= 1;
            return Err(StorageError::CheckpointWrite {
                source: disk_full(),
            });
        }
        match &mut self.checkpoint_writes_left {
            Some(0) => {
                return Err(StorageError::CheckpointWrite {
                    source: disk_full(),
                })
            }
            Some(left) => *left -= 1,
            None => {}
        }
        self.inner.set_checkpoint(timestamp)
    }
}

fn reader_source(input: &'static str, identity: &str) -> LogSource {
    LogSource::from_reader(input.as_bytes(), identity, &ReaderConfig::default())
}

#[tokio::test]
async fn mixed_stream_is_stored_line_by_line() {
    let input = concat!(
        "api | {\"event\":\"start\",\"level\":\"info\",\"x\":1}\n",
        "not json at all\n",
        "{\"foo\":1}\n",
        "[1,2,3]\n",
        "\n",
        "{\"event\":\"call\",\"level\":\"debug\",\"function_kwargs\":{\"a\":1},\"correlation_id\":\"c-9\"}\n",
    );
    let mut pipeline = Pipeline::new(
        SqliteStore::open_in_memory().expect("store"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");

    let summary = pipeline
        .run(reader_source(input, "worker-1"), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::SourceExhausted);
    assert_eq!(summary.stats.lines_read, 6);
    assert_eq!(summary.stats.structured, 2);
    assert_eq!(summary.stats.unstructured, 4);
    assert_eq!(summary.stats.malformed, 4);
    assert_eq!(summary.stats.failed, 0);

    let store = pipeline.store();
    let structured = store.structured_records().expect("structured");
    assert_eq!(structured[0].service, "api");
    assert_eq!(json!(structured[0].custom_fields), json!({"x": 1}));
    assert_eq!(structured[1].service, "worker-1");
    assert_eq!(structured[1].correlation_id, "c-9");
    assert_eq!(structured[1].function_kwargs, json!({"a": 1}));

    let unstructured = store.unstructured_records().expect("unstructured");
    let logs: Vec<_> = unstructured.iter().map(|r| r.log.as_str()).collect();
    assert_eq!(logs, vec!["not json at all", "{\"foo\":1}", "[1,2,3]", ""]);
    assert!(unstructured.iter().all(|r| r.source == "worker-1"));

    let last = structured[1].timestamp;
    assert_eq!(summary.checkpoint, Some(last));
    assert_eq!(store.checkpoint().expect("checkpoint"), Some(last));
}

#[tokio::test]
async fn storage_fault_is_isolated_to_its_line() {
    let input = "first\nreject me\nthird\n";
    let mut pipeline = Pipeline::new(
        FlakyStore::new("reject"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");

    let summary = pipeline
        .run(reader_source(input, "s"), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::SourceExhausted);
    assert_eq!(summary.stats.lines_read, 3);
    assert_eq!(summary.stats.unstructured, 2);
    assert_eq!(summary.stats.failed, 1);

    let stored = pipeline.store().inner.unstructured_records().expect("records");
    let logs: Vec<_> = stored.iter().map(|r| r.log.as_str()).collect();
    assert_eq!(logs, vec!["first", "third"]);
}

#[tokio::test]
async fn failed_line_does_not_advance_checkpoint() {
    let input = "kept\nreject me\n";
    let mut pipeline = Pipeline::new(
        FlakyStore::new("reject"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");

    let summary = pipeline
        .run(reader_source(input, "s"), CancellationToken::new())
        .await
        .expect("run");

    let stored = pipeline.store().inner.unstructured_records().expect("records");
    assert_eq!(stored.len(), 1);
    assert_eq!(summary.checkpoint, Some(stored[0].timestamp));
}

#[tokio::test]
async fn pending_checkpoint_is_flushed_at_run_end() {
    let mut store = FlakyStore::new("never");
    store.checkpoint_failures = 1;
    let mut pipeline =
        Pipeline::new(store, LineClassifier::default(), ReaderConfig::default()).expect("pipeline");

    let summary = pipeline
        .run(reader_source("only line\n", "s"), CancellationToken::new())
        .await
        .expect("run");

    let stored = pipeline.store().inner.unstructured_records().expect("records");
    assert_eq!(summary.stats.failed, 0);
    assert_eq!(summary.checkpoint, Some(stored[0].timestamp));
    assert_eq!(
        pipeline.store().checkpoint().expect("checkpoint"),
        Some(stored[0].timestamp)
    );
}

#[tokio::test]
async fn cancellation_stops_an_open_stream() {
    let (mut writer, reader) = tokio::io::duplex(1024);
    writer.write_all(b"first\n").await.expect("write");

    let mut pipeline = Pipeline::new(
        SqliteStore::open_in_memory().expect("store"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let source = LogSource::from_reader(reader, "live", &ReaderConfig::default());
    let summary = tokio::time::timeout(Duration::from_secs(5), pipeline.run(source, shutdown))
        .await
        .expect("run returns after cancellation")
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.stats.lines_read, 1);
    assert!(summary.checkpoint.is_some());
    drop(writer);
}

#[tokio::test]
async fn source_runs_at_most_one_line_ahead_of_the_store() {
    let input: String = (0..200).map(|n| format!("line {n}\n")).collect();
    let mut source = LogSource::from_reader(
        std::io::Cursor::new(input.into_bytes()),
        "s",
        &ReaderConfig::default(),
    );
    let mut pipeline = Pipeline::new(
        SqliteStore::open_in_memory().expect("store"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");

    for _ in 0..3 {
        let raw = source.recv().await.expect("source").expect("line");
        pipeline.ingest_line(&raw).expect("store line");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = pipeline.store().count_unstructured().expect("count");
    assert_eq!(stored, 3);
    assert!(source.lines_forwarded() - stored <= 1);
    source.shutdown().await;
}

#[tokio::test]
async fn lost_checkpoint_write_replays_exactly_one_line_after_restart() {
    let dir = TempDir::new().expect("temp dir");
    let database = dir.path().join("logs.db");

    // "b" is appended but its checkpoint write (and the final flush) fail.
    let first_run = {
        let mut store = FlakyStore::wrap(SqliteStore::open(&database).expect("store"), "never");
        store.checkpoint_writes_left = Some(1);
        let mut pipeline = Pipeline::new(store, LineClassifier::default(), ReaderConfig::default())
            .expect("pipeline");
        let summary = pipeline
            .run(reader_source("a\nb\n", "s"), CancellationToken::new())
            .await
            .expect("first run");
        let stored = pipeline.store().inner.unstructured_records().expect("records");
        assert_eq!(summary.checkpoint, Some(stored[0].timestamp));
        stored
    };
    let logs: Vec<_> = first_run.iter().map(|r| r.log.as_str()).collect();
    assert_eq!(logs, vec!["a", "b"]);

    let mut pipeline = Pipeline::new(
        SqliteStore::open(&database).expect("reopen"),
        LineClassifier::default(),
        ReaderConfig::default(),
    )
    .expect("pipeline");
    let resume = pipeline.resume_from().expect("checkpoint survives restart");
    assert_eq!(resume, first_run[0].timestamp);

    // The producer replays everything after the resume point.
    let replay: String = first_run
        .iter()
        .filter(|r| r.timestamp > resume)
        .map(|r| format!("{}\n", r.log))
        .collect();
    let source = LogSource::from_reader(
        std::io::Cursor::new(replay.into_bytes()),
        "s",
        &ReaderConfig::default(),
    );
    let summary = pipeline
        .run(source, CancellationToken::new())
        .await
        .expect("second run");

    assert_eq!(summary.stats.lines_read, 1);
    let stored = pipeline.store().unstructured_records().expect("records");
    let logs: Vec<_> = stored.iter().map(|r| r.log.as_str()).collect();
    assert_eq!(logs, vec!["a", "b", "b"]);
    assert_eq!(summary.checkpoint, Some(stored[2].timestamp));
}
