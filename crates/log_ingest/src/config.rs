use std::path::{Path, PathBuf};

use log_events::ClassifierConfig;
use serde::Deserialize;

use crate::{ConfigError, ReaderConfig, SourceSpec};

pub const DEFAULT_DATABASE: &str = "logs.db";

/// Settings for one ingestion process, usually read from a TOML file.
///
/// ```toml
/// database = "/var/lib/log-ingest/logs.db"
///
/// [source]
/// kind = "containers"
/// names = ["api", "worker"]
///
/// [classifier]
/// service_delimiter = " | "
/// function_kwargs_max_bytes = 4096
///
/// [reader]
/// max_line_bytes = 262144
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub database: PathBuf,
    pub source: SourceSpec,
    pub classifier: ClassifierConfig,
    pub reader: ReaderConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            source: SourceSpec::default(),
            classifier: ClassifierConfig::default(),
            reader: ReaderConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        self.source.validate()?;
        self.classifier.validate()?;
        self.reader.validate()?;
        Ok(())
    }
}
