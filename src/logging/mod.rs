//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events. Binaries, benches and
//! tests that want to see them call [`init_logging_default`] or
//! [`init_with_config`] once; later calls are no-ops.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full filter directive, wins over everything else
//! - `HIPSTROM_LOG_LEVEL`: error, warn, info, debug or trace
//! - `HIPSTROM_LOG_FORMAT`: `human` or `json`
//! - `HIPSTROM_LOG_FILE`: additionally append JSON lines to this file

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "HIPSTROM_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "HIPSTROM_LOG_FORMAT";
const LOG_FILE_ENV: &str = "HIPSTROM_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another subscriber was installed first
    #[error("global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLogLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidLogFormat(s.to_string())),
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Raw filter directive; overrides `level` when set
    pub filter: Option<String>,
    pub with_file_info: bool,
    /// Emit an event when a span closes
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, directive: impl Into<String>) -> Self {
        self.filter = Some(directive.into());
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Read settings from the environment
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        let mut config = Self::new();
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            config.level = level.parse()?;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        if let Some(path) = lookup(LOG_FILE_ENV).filter(|p| !p.is_empty()) {
            config.log_file = Some(PathBuf::from(path));
        }
        if let Some(directive) = lookup("RUST_LOG").filter(|d| !d.is_empty()) {
            config.filter = Some(directive);
        }
        Ok(config)
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| LoggingError::InvalidFilter(e.to_string())),
            None => Ok(EnvFilter::new(self.level.as_filter_str())),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn console_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_file(self.with_file_info)
            .with_line_number(self.with_file_info)
            .with_span_events(self.span_events());
        match self.format {
            LogFormat::Human => layer.with_target(true).boxed(),
            LogFormat::Json => layer.json().with_target(false).boxed(),
        }
    }

    fn file_layer(&self, file: File) -> Box<dyn Layer<Registry> + Send + Sync> {
        fmt::layer()
            .json()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(self.span_events())
            .boxed()
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let wrap = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(wrap)
}

/// Install the global subscriber described by `config`
///
/// Fails if a subscriber is already installed, including one installed by
/// an earlier call.
pub fn try_init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = config.env_filter()?;
    let mut layers = vec![config.console_layer()];
    if let Some(path) = &config.log_file {
        layers.push(config.file_layer(open_log_file(path)?));
    }
    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the subscriber once per process; later calls do nothing
pub fn init_with_config(config: &LoggingConfig) {
    if is_initialized() {
        return;
    }
    if let Err(e) = try_init(config) {
        eprintln!("hipstrom: logging not initialized: {}", e);
        let _ = TRACING_INITIALIZED.set(());
    }
}

/// Install the subscriber from `HIPSTROM_*` variables
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let config = LoggingConfig::from_env()?;
    init_with_config(&config);
    Ok(())
}

/// Like [`init_logging_from_env`], falling back to defaults on bad input
pub fn init_logging_default() {
    let config = LoggingConfig::from_env().unwrap_or_else(|e| {
        eprintln!("hipstrom: {}; using default logging", e);
        LoggingConfig::default()
    });
    init_with_config(&config);
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_level_and_format_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" trace ".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = LoggingConfig::from_lookup(lookup(&[
            ("HIPSTROM_LOG_LEVEL", "debug"),
            ("HIPSTROM_LOG_FORMAT", "json"),
            ("HIPSTROM_LOG_FILE", "/tmp/hipstrom.log"),
        ]))
        .unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/hipstrom.log")));
        assert!(config.filter.is_none());

        let config = LoggingConfig::from_lookup(lookup(&[("RUST_LOG", "hipstrom=trace")])).unwrap();
        assert_eq!(config.filter.as_deref(), Some("hipstrom=trace"));

        assert!(LoggingConfig::from_lookup(lookup(&[("HIPSTROM_LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let config = LoggingConfig::new().with_filter("hipstrom=[");
        assert!(matches!(config.env_filter(), Err(LoggingError::InvalidFilter(_))));
    }

    #[test]
    fn test_log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("strom.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(is_initialized());
        assert!(try_init(&LoggingConfig::default()).is_err());
    }
}
