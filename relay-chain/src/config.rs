use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The file a [`ConfigError`] refers to, rendered as a suffix of the error message.
#[derive(Debug, Default)]
struct ConfigFile(Option<PathBuf>);

impl fmt::Display for ConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ref file) => write!(f, " (file {})", file.display()),
            None => Ok(()),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{file}")]
pub struct ConfigError {
    file: ConfigFile,
    kind: ConfigErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            file: ConfigFile::default(),
            kind,
            source: None,
        }
    }

    #[inline]
    fn wrap<E>(source: E, kind: ConfigErrorKind) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            file: ConfigFile::default(),
            kind,
            source: Some(Box::new(source)),
        }
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = ConfigFile(Some(path.as_ref().to_path_buf()));
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// The file extension is neither YAML nor JSON.
    #[error("unsupported config file format")]
    UnsupportedFormat,
    /// The relay queue needs room for at least one item.
    #[error("queue capacity must be at least 1")]
    InvalidCapacity,
}

enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yml" | "yaml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn parse(&self, contents: &str) -> Result<ChainConfig, ConfigError> {
        match self {
            Self::Yaml => serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml)),
            Self::Json => serde_json::from_str(contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson)),
        }
    }
}

/// Configuration of a [`Chain`](crate::Chain).
///
/// The configuration implements `serde` traits, so it can be embedded into configuration files.
/// Missing fields take their default values.
///
/// ```
/// use relay_chain::ChainConfig;
///
/// let config = ChainConfig::from_yaml_str("capacity: 8").unwrap();
/// assert_eq!(config.capacity, 8);
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Maximum number of items waiting in the relay queue for the consumer.
    ///
    /// Defaults to `1`, so that every producer is held back until the consumer took the previous
    /// item. Larger values let fast producers run ahead of the consumer.
    pub capacity: usize,
}

impl ChainConfig {
    /// Creates a configuration with the given queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Parses a configuration from a YAML string and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config = ConfigFormat::Yaml.parse(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file and validates it.
    ///
    /// The format is chosen by extension: `.yml` and `.yaml` are parsed as YAML, `.json` as
    /// JSON.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::new(ConfigErrorKind::UnsupportedFormat).file(path))?;

        let contents = fs::read_to_string(path).map_err(|e: io::Error| {
            ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path)
        })?;

        let config = format.parse(&contents).map_err(|e| e.file(path))?;
        config.validate().map_err(|e| e.file(path))?;
        Ok(config)
    }

    /// Checks that all values are within their allowed ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidCapacity));
        }

        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}
