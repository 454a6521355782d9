//! Collector configuration.
//!
//! Values come from built-in defaults, then an optional TOML file. The binary
//! applies command-line and environment overrides on top.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::flush::{
    FailurePolicy, FlushConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_TIMEOUT, DEFAULT_TABLE,
};

pub const DEFAULT_ADDR: &str = ":8080";
pub const DEFAULT_DB_URL: &str = "http://localhost:8123/";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address; `:port` binds every interface.
    pub addr: String,
    /// Bulk-copy endpoint of the storage backend.
    pub db_url: String,
    pub table: String,
    /// Integer seconds or a humantime string such as `"500ms"`.
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_timeout: Duration,
    /// How long open connections get to finish after shutdown starts.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_grace: Duration,
    pub on_flush_failure: FailurePolicy,
    pub logging: LoggingConfig,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_owned(),
            db_url: DEFAULT_DB_URL.to_owned(),
            table: DEFAULT_TABLE.to_owned(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            on_flush_failure: FailurePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}
impl Config {
    /// Loads `path`, or `config.toml` in the working directory if it exists,
    /// or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if default_path.exists() => Self::from_file(default_path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush_interval must be positive".into()));
        }
        if self.flush_timeout.is_zero() {
            return Err(ConfigError::Invalid("flush_timeout must be positive".into()));
        }
        if self.table.is_empty() {
            return Err(ConfigError::Invalid("table must not be empty".into()));
        }
        Ok(())
    }

    /// The address to hand to the socket layer.
    pub fn listen_addr(&self) -> String {
        match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.addr.clone(),
        }
    }

    /// Host and port of `db_url`, without scheme, credentials or path.
    pub fn db_host(&self) -> &str {
        let rest = self
            .db_url
            .split_once("://")
            .map_or(self.db_url.as_str(), |(_, rest)| rest);
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host)
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            interval: self.flush_interval,
            timeout: self.flush_timeout,
            table: self.table.clone(),
            on_failure: self.on_flush_failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `metrics_collector=debug`.
    pub level: String,
    pub format: LogFormat,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::default(),
        }
    }
}

/// Parses integer seconds or a humantime duration.
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    let s = s.trim();
    match s.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(s),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Secs(u64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Secs(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
