//! External log sources.
//!
//! A [`LogSource`] owns the child processes (or reader) producing log output
//! and merges every stream into one bounded channel of [`RawLine`]s. Each
//! stream gets a forwarding task that only reads and splits bytes; nothing
//! here classifies or stores.

mod lines;
mod process;

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log_events::Timestamp;
use serde::Deserialize;
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{ReaderConfigError, SourceError, SourceSpecError};
use lines::BoundedLineReader;

pub const DEFAULT_DOCKER_PROGRAM: &str = "docker";
pub const COMPOSE_IDENTITY: &str = "docker-compose";
pub const STDIN_IDENTITY: &str = "stdin";

/// One line as delivered by a stream, tagged with that stream's identity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawLine {
    pub line: String,
    pub source: String,
}

/// Which external log producer to attach to.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// `docker compose logs --follow`: one multiplexed stream whose lines carry
    /// their own `service | ` prefix.
    Compose {
        #[serde(default = "default_docker_program")]
        program: PathBuf,
        #[serde(default)]
        project_directory: Option<PathBuf>,
        /// Restrict to these services; empty means all of them.
        #[serde(default)]
        services: Vec<String>,
    },
    /// `docker logs --follow <name>` per container. Empty `names` discovers
    /// the running containers at start.
    Containers {
        #[serde(default = "default_docker_program")]
        program: PathBuf,
        #[serde(default)]
        names: Vec<String>,
    },
    /// Any program whose stdout is the log stream.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        identity: String,
        /// Flag used to pass the resume point as `<flag>=<RFC3339>`.
        #[serde(default)]
        since_flag: Option<String>,
        /// Treat stderr as log output too instead of debug-logging it.
        #[serde(default)]
        include_stderr: bool,
    },
    /// Standard input of this process. Finite; resume filtering does not apply.
    Stdin {
        #[serde(default = "default_stdin_identity")]
        identity: String,
    },
}

fn default_docker_program() -> PathBuf {
    PathBuf::from(DEFAULT_DOCKER_PROGRAM)
}

fn default_stdin_identity() -> String {
    STDIN_IDENTITY.to_string()
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self::compose()
    }
}

impl SourceSpec {
    pub fn compose() -> Self {
        Self::Compose {
            program: default_docker_program(),
            project_directory: None,
            services: Vec::new(),
        }
    }

    pub fn containers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Containers {
            program: default_docker_program(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn command<I, S>(program: impl Into<PathBuf>, args: I, identity: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            identity: identity.into(),
            since_flag: None,
            include_stderr: false,
        }
    }

    pub fn stdin() -> Self {
        Self::Stdin {
            identity: default_stdin_identity(),
        }
    }

    /// Replaces the executable of a process-backed source.
    pub fn with_program(mut self, new_program: impl Into<PathBuf>) -> Self {
        match &mut self {
            Self::Compose { program, .. }
            | Self::Containers { program, .. }
            | Self::Command { program, .. } => *program = new_program.into(),
            Self::Stdin { .. } => {}
        }
        self
    }

    /// Sets the resume flag of a `Command` source; other kinds are unchanged.
    pub fn with_since_flag(mut self, flag: impl Into<String>) -> Self {
        if let Self::Command { since_flag, .. } = &mut self {
            *since_flag = Some(flag.into());
        }
        self
    }

    pub fn with_stderr(mut self, include: bool) -> Self {
        if let Self::Command { include_stderr, .. } = &mut self {
            *include_stderr = include;
        }
        self
    }

    /// Identity recorded for lines of a single-stream source.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Compose { .. } => Some(COMPOSE_IDENTITY),
            Self::Containers { .. } => None,
            Self::Command { identity, .. } | Self::Stdin { identity } => Some(identity.as_str()),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SourceSpecError> {
        match self {
            Self::Compose { program, .. } | Self::Containers { program, .. } => {
                if program.as_os_str().is_empty() {
                    return Err(SourceSpecError::EmptyProgram);
                }
            }
            Self::Command {
                program, identity, ..
            } => {
                if program.as_os_str().is_empty() {
                    return Err(SourceSpecError::EmptyProgram);
                }
                if identity.trim().is_empty() {
                    return Err(SourceSpecError::EmptyIdentity);
                }
            }
            Self::Stdin { identity } => {
                if identity.trim().is_empty() {
                    return Err(SourceSpecError::EmptyIdentity);
                }
            }
        }
        Ok(())
    }
}

/// Reader-side limits shared by every stream.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Longer lines keep their first `max_line_bytes` bytes.
    pub max_line_bytes: usize,
    pub skip_blank_lines: bool,
    /// Lines buffered between the forwarding tasks and the pipeline.
    pub channel_capacity: usize,
}

impl ReaderConfig {
    pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
    /// One slot keeps the readers at most one line ahead of the store, so a
    /// cancelled run drops at most that line from the channel.
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

    pub(crate) fn validate(&self) -> Result<(), ReaderConfigError> {
        if self.max_line_bytes == 0 {
            return Err(ReaderConfigError::ZeroMaxLineBytes);
        }
        if self.channel_capacity == 0 {
            return Err(ReaderConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: Self::DEFAULT_MAX_LINE_BYTES,
            skip_blank_lines: false,
            channel_capacity: Self::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Stderr lines kept for the report of a failed process.
const STDERR_TAIL_LINES: usize = 20;

/// What travels from the stream tasks to [`LogSource::recv`].
enum SourceEvent {
    Line(RawLine),
    Failed(SourceError),
}

/// What one reader task saw before its pipe closed.
#[derive(Debug, Default)]
struct ReaderOutcome {
    forwarded: u64,
    stderr_tail: VecDeque<String>,
}

impl ReaderOutcome {
    fn merge(&mut self, other: ReaderOutcome) {
        self.forwarded += other.forwarded;
        self.stderr_tail.extend(other.stderr_tail);
    }

    fn stderr(&self) -> String {
        self.stderr_tail
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct ChildProcess {
    program: PathBuf,
    child: Child,
}

struct Stream {
    label: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// A running set of log streams merged into one channel.
///
/// Dropping a `LogSource` kills its children; [`LogSource::shutdown`] also
/// waits for them.
pub struct LogSource {
    rx: mpsc::Receiver<SourceEvent>,
    streams: Vec<Stream>,
    forwarded: Arc<AtomicU64>,
}

impl LogSource {
    /// Starts the producer described by `spec`. When `since` is set and the
    /// source kind supports it, only output at or after it is requested.
    pub async fn start(
        spec: &SourceSpec,
        since: Option<Timestamp>,
        config: &ReaderConfig,
    ) -> Result<Self, SourceError> {
        let (mut source, tx) = Self::with_channel(config);

        match spec {
            SourceSpec::Compose {
                program,
                project_directory,
                services,
            } => {
                let args = compose_args(project_directory.as_deref(), services, since);
                source
                    .spawn_stream(program, &args, COMPOSE_IDENTITY, false, &tx, config)
                    .await?;
            }
            SourceSpec::Containers { program, names } => {
                let names = if names.is_empty() {
                    process::discover_containers(program).await?
                } else {
                    names.clone()
                };
                for name in &names {
                    let args = container_args(name, since);
                    source
                        .spawn_stream(program, &args, name, true, &tx, config)
                        .await?;
                }
            }
            SourceSpec::Command {
                program,
                args,
                identity,
                since_flag,
                include_stderr,
            } => {
                let mut args = args.clone();
                match (since_flag, since) {
                    (Some(flag), Some(since)) => args.push(since_arg(flag, since)),
                    (None, Some(since)) => {
                        debug!(%since, program = %program.display(), "source has no since flag; reading all output");
                    }
                    _ => {}
                }
                source
                    .spawn_stream(program, &args, identity, *include_stderr, &tx, config)
                    .await?;
            }
            SourceSpec::Stdin { identity } => {
                if let Some(since) = since {
                    debug!(%since, "resume filter does not apply to stdin");
                }
                source.attach_reader(tokio::io::stdin(), identity, &tx, config);
            }
        }

        info!(streams = source.streams.len(), "log source started");
        Ok(source)
    }

    /// Wraps any byte stream as a single-stream source.
    pub fn from_reader<R>(reader: R, identity: impl Into<String>, config: &ReaderConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (mut source, tx) = Self::with_channel(config);
        source.attach_reader(reader, &identity.into(), &tx, config);
        source
    }

    /// Next line from any stream; `Ok(None)` once every stream has ended.
    ///
    /// A process that exits unsuccessfully before writing a single line is
    /// reported as [`SourceError::Exited`] once its readers are drained.
    pub async fn recv(&mut self) -> Result<Option<RawLine>, SourceError> {
        match self.rx.recv().await {
            Some(SourceEvent::Line(raw)) => Ok(Some(raw)),
            Some(SourceEvent::Failed(err)) => Err(err),
            None => Ok(None),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Lines handed to the channel so far, whether or not they were received.
    pub fn lines_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Stops every stream, kills child processes and waits for them.
    pub async fn shutdown(mut self) {
        self.rx.close();
        for stream in &mut self.streams {
            if let Some(stop) = stream.stop.take() {
                let _ = stop.send(());
            }
        }
        for stream in self.streams.drain(..) {
            if let Err(err) = stream.task.await {
                warn!(stream = %stream.label, error = %err, "log stream task failed");
            }
        }
        debug!("log source shut down");
    }

    fn with_channel(config: &ReaderConfig) -> (Self, mpsc::Sender<SourceEvent>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let source = Self {
            rx,
            streams: Vec::new(),
            forwarded: Arc::new(AtomicU64::new(0)),
        };
        (source, tx)
    }

    async fn spawn_stream(
        &mut self,
        program: &Path,
        args: &[String],
        identity: &str,
        include_stderr: bool,
        tx: &mpsc::Sender<SourceEvent>,
        config: &ReaderConfig,
    ) -> Result<(), SourceError> {
        debug!(program = %program.display(), ?args, identity, "spawning log source");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process::spawn_with_retry(&mut command, program).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::StdoutUnavailable {
                program: program.to_path_buf(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SourceError::StderrUnavailable {
                program: program.to_path_buf(),
            })?;

        let mut readers = vec![self.forward(stdout, identity, tx, config)];
        if include_stderr {
            readers.push(self.forward(stderr, identity, tx, config));
        } else {
            readers.push(tokio::spawn(drain_stderr(
                stderr,
                identity.to_string(),
                config.max_line_bytes,
            )));
        }

        let process = ChildProcess {
            program: program.to_path_buf(),
            child,
        };
        self.push_stream(identity, Some(process), readers, tx);
        Ok(())
    }

    fn attach_reader<R>(
        &mut self,
        reader: R,
        identity: &str,
        tx: &mpsc::Sender<SourceEvent>,
        config: &ReaderConfig,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let readers = vec![self.forward(reader, identity, tx, config)];
        self.push_stream(identity, None, readers, tx);
    }

    fn forward<R>(
        &self,
        reader: R,
        identity: &str,
        tx: &mpsc::Sender<SourceEvent>,
        config: &ReaderConfig,
    ) -> JoinHandle<ReaderOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(forward_lines(
            reader,
            identity.to_string(),
            tx.clone(),
            Arc::clone(&self.forwarded),
            config.clone(),
        ))
    }

    fn push_stream(
        &mut self,
        label: &str,
        process: Option<ChildProcess>,
        readers: Vec<JoinHandle<ReaderOutcome>>,
        tx: &mpsc::Sender<SourceEvent>,
    ) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            label.to_string(),
            process,
            readers,
            tx.clone(),
            stop_rx,
        ));
        self.streams.push(Stream {
            label: label.to_string(),
            stop: Some(stop_tx),
            task,
        });
    }
}

fn since_arg(flag: &str, since: Timestamp) -> String {
    format!("{flag}={}", since.to_rfc3339())
}

fn compose_args(
    project_directory: Option<&Path>,
    services: &[String],
    since: Option<Timestamp>,
) -> Vec<String> {
    let mut args = vec!["compose".to_string()];
    if let Some(dir) = project_directory {
        args.push("--project-directory".to_string());
        args.push(dir.display().to_string());
    }
    args.extend(["logs", "--follow", "--no-color"].map(String::from));
    if let Some(since) = since {
        args.push(since_arg("--since", since));
    }
    args.extend(services.iter().cloned());
    args
}

fn container_args(name: &str, since: Option<Timestamp>) -> Vec<String> {
    let mut args = vec!["logs".to_string(), "--follow".to_string()];
    if let Some(since) = since {
        args.push(since_arg("--since", since));
    }
    args.push(name.to_string());
    args
}

/// Waits for a stream's readers to finish (then reaps the child and reports
/// how it exited) or for a stop request (then aborts the readers and kills
/// the child).
async fn supervise(
    label: String,
    mut process: Option<ChildProcess>,
    readers: Vec<JoinHandle<ReaderOutcome>>,
    tx: mpsc::Sender<SourceEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
    let reader_label = label.clone();
    let readers_done = async move {
        let mut outcome = ReaderOutcome::default();
        for reader in readers {
            match reader.await {
                Ok(done) => outcome.merge(done),
                Err(err) => warn!(stream = %reader_label, error = %err, "log reader task failed"),
            }
        }
        outcome
    };

    let outcome = tokio::select! {
        outcome = readers_done => outcome,
        _ = &mut stop => {
            for abort in &aborts {
                abort.abort();
            }
            kill(&label, process.as_mut().map(|process| &mut process.child)).await;
            return;
        }
    };

    let Some(process) = process.as_mut() else {
        info!(stream = %label, lines = outcome.forwarded, "log stream ended");
        return;
    };
    let status = tokio::select! {
        status = process.child.wait() => status,
        _ = &mut stop => {
            kill(&label, Some(&mut process.child)).await;
            return;
        }
    };

    match status {
        Ok(status) if status.success() => {
            info!(stream = %label, %status, lines = outcome.forwarded, "log stream ended");
        }
        Ok(status) if outcome.forwarded == 0 => {
            let stderr = outcome.stderr();
            error!(stream = %label, %status, stderr = %stderr, "log source exited without output");
            let failure = SourceError::Exited {
                program: process.program.clone(),
                status,
                stderr,
            };
            if tx.send(SourceEvent::Failed(failure)).await.is_err() {
                debug!(stream = %label, "line consumer closed before exit was reported");
            }
        }
        Ok(status) => {
            warn!(
                stream = %label,
                %status,
                lines = outcome.forwarded,
                stderr = %outcome.stderr(),
                "log source exited unsuccessfully"
            );
        }
        Err(err) => warn!(stream = %label, error = %err, "log stream ended; exit status unknown"),
    }
}

async fn kill(label: &str, child: Option<&mut Child>) {
    let Some(child) = child else {
        return;
    };
    match child.kill().await {
        Ok(()) => debug!(stream = %label, "log source process terminated"),
        Err(err) => debug!(stream = %label, error = %err, "log source process already gone"),
    }
}

async fn forward_lines<R>(
    reader: R,
    identity: String,
    tx: mpsc::Sender<SourceEvent>,
    forwarded: Arc<AtomicU64>,
    config: ReaderConfig,
) -> ReaderOutcome
where
    R: AsyncRead + Unpin,
{
    let mut outcome = ReaderOutcome::default();
    let mut lines = BoundedLineReader::new(reader, config.max_line_bytes);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.truncated {
                    warn!(
                        source = %identity,
                        line_number = line.line_number,
                        observed_bytes = line.observed_bytes,
                        max_line_bytes = config.max_line_bytes,
                        "log line exceeds max_line_bytes; keeping prefix"
                    );
                }
                let text = line.text();
                if config.skip_blank_lines && text.is_empty() {
                    continue;
                }
                let raw = RawLine {
                    line: text,
                    source: identity.clone(),
                };
                if tx.send(SourceEvent::Line(raw)).await.is_err() {
                    debug!(source = %identity, "line consumer closed");
                    return outcome;
                }
                outcome.forwarded += 1;
                forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                debug!(source = %identity, "log stream reached end of input");
                return outcome;
            }
            Err(err) => {
                warn!(source = %identity, error = %err, "failed to read log stream");
                return outcome;
            }
        }
    }
}

async fn drain_stderr<R>(reader: R, identity: String, max_line_bytes: usize) -> ReaderOutcome
where
    R: AsyncRead + Unpin,
{
    let mut outcome = ReaderOutcome::default();
    let mut lines = BoundedLineReader::new(reader, max_line_bytes);
    while let Ok(Some(line)) = lines.next_line().await {
        let text = line.text();
        if text.is_empty() {
            continue;
        }
        debug!(source = %identity, stderr = %text, "log source stderr");
        if outcome.stderr_tail.len() == STDERR_TAIL_LINES {
            outcome.stderr_tail.pop_front();
        }
        outcome.stderr_tail.push_back(text);
    }
    outcome
}
