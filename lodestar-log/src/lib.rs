//! Logging setup for Lodestar
//!
//! Every Lodestar process logs through `tracing`. This crate owns the one
//! place where a subscriber gets installed, so the registry, the gateway and
//! any embedded heartbeat agent all emit the same shape of output.
//! Defaults to JSON on STDOUT.
//!
//! # Examples
//!
//! ```no_run
//! use lodestar_log::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = LogConfig::from_env()
//!         .format(LogFormat::Pretty)
//!         .init()
//!         .expect("logging");
//!
//!     info!("registry starting");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `LODESTAR_DEBUG=1` - shorthand for debug level
//! - `LODESTAR_LOG_LEVEL=trace|debug|info|warn|error`
//! - `LODESTAR_LOG_FORMAT=json|plain|pretty|compact`
//! - `RUST_LOG` - full filter directive, wins over the level

use std::io;
use std::str::FromStr;
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use tracing::{Level, debug, error, info, trace, warn};
pub use tracing_appender;

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log file could not be opened.
    #[error("Failed to open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The filter directive did not parse.
    #[error("Invalid log filter '{0}'")]
    Filter(String),

    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Directive string for EnvFilter
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Output format for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured, machine-readable (default)
    Json,
    /// Single line, no colours
    Plain,
    /// Multi-line, for local development
    Pretty,
    /// Minimal single line
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "plain" => Ok(LogFormat::Plain),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Output destination for logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Append to a single file
    File(String),
    /// Rotating log files
    RollingFile {
        directory: String,
        prefix: String,
        rotation: Rotation,
    },
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Rotation {
    fn to_tracing_rotation(self) -> tracing_appender::rolling::Rotation {
        match self {
            Rotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
            Rotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
            Rotation::Daily => tracing_appender::rolling::Rotation::DAILY,
            Rotation::Never => tracing_appender::rolling::Rotation::NEVER,
        }
    }
}

/// Logging configuration
///
/// ```
/// use lodestar_log::*;
///
/// let config = LogConfig::new()
///     .level(LogLevel::Debug)
///     .format(LogFormat::Compact)
///     .with_env_filter("lodestar_gateway=trace,hyper=warn");
/// assert_eq!(config.level, LogLevel::Debug);
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Add thread ids, source file and line to every event
    pub source_details: bool,
    /// Emit an event when a span closes, and span context in JSON
    pub spans: bool,
    /// ANSI colours; ignored by the JSON and plain formats
    pub colors: bool,
    /// Custom filter directive, overrides `level` when set
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            source_details: false,
            spans: false,
            colors: false,
            env_filter: None,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the `LODESTAR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let mut config = Self::default();
        if flag("LODESTAR_DEBUG") {
            config.level = LogLevel::Debug;
            config.source_details = true;
        }
        if let Some(level) = lookup("LODESTAR_LOG_LEVEL").and_then(|s| s.parse().ok()) {
            config.level = level;
        }
        if let Some(format) = lookup("LODESTAR_LOG_FORMAT").and_then(|s| s.parse::<LogFormat>().ok()) {
            config = config.format(format);
        }
        config
    }

    /// Choose the format; terminal formats switch colours on.
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self.colors = matches!(format, LogFormat::Pretty | LogFormat::Compact);
        self
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_source_details(mut self, enable: bool) -> Self {
        self.source_details = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    /// Set a filter directive such as `"lodestar_registry=debug,hyper=info"`.
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Resolve the effective filter: explicit directive, then `RUST_LOG`,
    /// then the configured level.
    pub fn build_filter(&self) -> Result<EnvFilter, LogError> {
        if let Some(directive) = &self.env_filter {
            return EnvFilter::try_new(directive).map_err(|_| LogError::Filter(directive.clone()));
        }
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str())))
    }

    /// Install the global subscriber.
    ///
    /// The returned guard flushes the non-blocking writer on drop and must be
    /// held for the lifetime of the process.
    pub fn init(self) -> Result<WorkerGuard, LogError> {
        let filter = self.build_filter()?;
        let (writer, guard) = self.output.open()?;

        tracing_subscriber::registry()
            .with(self.layer(writer).with_filter(filter))
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;
        Ok(guard)
    }

    fn layer(&self, writer: NonBlocking) -> BoxedLayer {
        let span_events = if self.spans { FmtSpan::CLOSE } else { FmtSpan::NONE };
        let base = fmt::layer()
            .with_writer(writer)
            .with_thread_ids(self.source_details)
            .with_file(self.source_details)
            .with_line_number(self.source_details)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Json => base
                .json()
                .with_current_span(self.spans)
                .with_span_list(self.spans)
                .boxed(),
            LogFormat::Plain => base.with_ansi(false).boxed(),
            LogFormat::Pretty => base.pretty().with_ansi(self.colors).boxed(),
            LogFormat::Compact => base.compact().with_ansi(self.colors).boxed(),
        }
    }
}

impl LogOutput {
    fn open(&self) -> Result<(NonBlocking, WorkerGuard), LogError> {
        Ok(match self {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LogError::File {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            LogOutput::RollingFile {
                directory,
                prefix,
                rotation,
            } => tracing_appender::non_blocking(RollingFileAppender::new(
                rotation.to_tracing_rotation(),
                directory,
                prefix,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(!config.source_details);
        assert!(!config.colors);
    }

    #[test]
    fn test_from_lookup() {
        let config = LogConfig::from_lookup(lookup(&[("LODESTAR_DEBUG", "true")]));
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.source_details);

        let config = LogConfig::from_lookup(lookup(&[
            ("LODESTAR_DEBUG", "1"),
            ("LODESTAR_LOG_LEVEL", "warn"),
            ("LODESTAR_LOG_FORMAT", "pretty"),
        ]));
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.colors);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let config = LogConfig::from_lookup(lookup(&[("LODESTAR_LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_format_sets_colors() {
        assert!(LogConfig::new().format(LogFormat::Compact).colors);
        assert!(!LogConfig::new().format(LogFormat::Plain).colors);
    }

    #[test]
    fn test_unopenable_log_file() {
        let err = LogConfig::new()
            .output(LogOutput::File("/nonexistent/dir/lodestar.log".to_string()))
            .init()
            .unwrap_err();
        assert!(matches!(err, LogError::File { .. }));
    }

    #[test]
    fn test_invalid_filter_directive() {
        let config = LogConfig::new().with_env_filter("lodestar=loud");
        assert!(matches!(config.build_filter(), Err(LogError::Filter(_))));
    }
}
