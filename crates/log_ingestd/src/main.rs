use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{ArgGroup, Parser};
use log_ingest::{
    ConfigError, IngestConfig, IngestError, Pipeline, RunSummary, SourceSpec, SqliteStore,
    StopReason,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "log-ingestd", about = "Ingest container logs into a SQLite store")]
#[command(group(ArgGroup::new("source").multiple(false)))]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "LOG_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database to append to (overrides `database`).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Follow `docker compose logs`.
    #[arg(long, group = "source")]
    compose: bool,

    /// Follow `docker logs` for this container; repeatable.
    #[arg(long = "container", value_name = "NAME", group = "source")]
    containers: Vec<String>,

    /// Follow every running container.
    #[arg(long, group = "source")]
    all_containers: bool,

    /// Read log lines from standard input until it closes.
    #[arg(long, group = "source")]
    stdin: bool,

    /// Docker executable for `--compose` and container sources.
    #[arg(long, value_name = "PATH")]
    docker: Option<PathBuf>,

    /// Source identity for `--stdin` and command sources.
    #[arg(long)]
    identity: Option<String>,

    /// Flag the command accepts for the resume point, e.g. `--since`.
    #[arg(long, value_name = "FLAG", allow_hyphen_values = true)]
    since_flag: Option<String>,

    /// Program (and arguments) whose stdout is the log stream.
    #[arg(last = true, value_name = "COMMAND", group = "source")]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<IngestConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                info!(config = %path.display(), "loading configuration");
                IngestConfig::load(path)?
            }
            None => IngestConfig::default(),
        };

        if let Some(database) = self.database.clone() {
            config.database = database;
        }
        if let Some(source) = self.source_override() {
            config.source = source;
        }
        if let Some(docker) = &self.docker {
            if matches!(
                config.source,
                SourceSpec::Compose { .. } | SourceSpec::Containers { .. }
            ) {
                config.source = config.source.with_program(docker);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn source_override(&self) -> Option<SourceSpec> {
        if self.compose {
            return Some(SourceSpec::compose());
        }
        if !self.containers.is_empty() {
            return Some(SourceSpec::containers(self.containers.iter().cloned()));
        }
        if self.all_containers {
            return Some(SourceSpec::containers(Vec::<String>::new()));
        }
        if self.stdin {
            return Some(match &self.identity {
                Some(identity) => SourceSpec::Stdin {
                    identity: identity.clone(),
                },
                None => SourceSpec::stdin(),
            });
        }
        let (program, args) = self.command.split_first()?;
        let identity = self.identity.clone().unwrap_or_else(|| {
            PathBuf::from(program)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.clone())
        });
        let mut spec = SourceSpec::command(program, args.iter().cloned(), identity);
        if let Some(flag) = &self.since_flag {
            spec = spec.with_since_flag(flag);
        }
        Some(spec)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(config));
    // A blocking stdin read cannot be interrupted; do not wait on it forever.
    runtime.shutdown_timeout(Duration::from_secs(2));

    match result {
        Ok(summary) => {
            if summary.stop_reason == StopReason::Cancelled {
                info!("stopped by signal");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "ingestion failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: IngestConfig) -> Result<RunSummary, IngestError> {
    info!(database = %config.database.display(), "opening log store");
    let store = SqliteStore::open(&config.database)?;
    let mut pipeline = Pipeline::from_config(store, &config)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    pipeline.ingest(&config.source, shutdown).await
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    shutdown_signal().await;
    shutdown.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler; only Ctrl-C stops ingestion");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = sigterm.recv() => {
            info!(signal = "SIGTERM", "signal received");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "SIGINT", "signal received"),
        Err(err) => {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
