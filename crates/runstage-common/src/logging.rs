//! Logging setup shared by the runstage binaries
//!
//! Logs go to the console, to a daily-rotated file, or to both, as plain text
//! or JSON. Everything is driven by `RUNSTAGE_LOG_*` environment variables so
//! the worker can be reconfigured without touching its config file.
//!
//! Steps log with structured fields rather than interpolated strings:
//!
//! ```rust
//! use tracing::info;
//!
//! let batch = "run42";
//! let bytes = 1024u64;
//! info!(batch = %batch, bytes, "Archive uploaded");
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Prefix shared by all logging environment variables
pub const ENV_PREFIX: &str = "RUNSTAGE_LOG_";

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very detailed trace-level logging
    Trace,
    /// Debug-level logging for development
    Debug,
    /// Informational messages
    #[default]
    Info,
    /// Warning messages
    Warn,
    /// Error messages
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Output target for logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Output to console only
    #[default]
    Console,
    /// Output to file only
    File,
    /// Output to both console and file
    Both,
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

impl std::fmt::Display for LogOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOutput::Console => write!(f, "console"),
            LogOutput::File => write!(f, "file"),
            LogOutput::Both => write!(f, "both"),
        }
    }
}

/// Log format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,

    /// Output target (console, file, or both)
    pub output: LogOutput,

    /// Log format (text or JSON)
    pub format: LogFormat,

    /// Directory for log files (only used when output includes file)
    pub log_dir: PathBuf,

    /// Log file name prefix ("runstage" -> "runstage.2024-01-18")
    pub log_file_prefix: String,

    /// Extra directives, e.g. "sqlx=warn,aws_sdk_s3=info"
    pub filter_directives: Option<String>,

    /// Whether to include file and line number in logs
    pub include_location: bool,

    /// Whether to include thread IDs in logs
    pub include_thread_ids: bool,

    /// Whether to include target module names in logs
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "runstage".to_string(),
            filter_directives: Some("sqlx=warn,aws_config=warn,hyper=warn".to_string()),
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Load configuration from `RUNSTAGE_LOG_*` environment variables
    ///
    /// Recognised suffixes: `LEVEL`, `OUTPUT`, `FORMAT`, `DIR`, `FILE_PREFIX`,
    /// `FILTER`, `INCLUDE_LOCATION`, `INCLUDE_THREAD_IDS`, `INCLUDE_TARGETS`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|suffix| std::env::var(format!("{ENV_PREFIX}{suffix}")).ok())
    }

    /// Same as [`LogConfig::from_env`] but reading from an arbitrary source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let flag = |suffix: &str, default: bool| {
            lookup(suffix)
                .and_then(|v| v.trim().parse::<bool>().ok())
                .unwrap_or(default)
        };

        if let Some(level) = lookup("LEVEL") {
            config.level = level.parse()?;
        }
        if let Some(output) = lookup("OUTPUT") {
            config.output = output.parse()?;
        }
        if let Some(format) = lookup("FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(dir) = lookup("DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        config.filter_directives = lookup("FILTER").or(config.filter_directives);
        config.include_location = flag("INCLUDE_LOCATION", config.include_location);
        config.include_thread_ids = flag("INCLUDE_THREAD_IDS", config.include_thread_ids);
        config.include_targets = flag("INCLUDE_TARGETS", config.include_targets);

        Ok(config)
    }
}

/// Keeps the non-blocking file writer alive. Drop it only at shutdown,
/// otherwise buffered log lines are lost.
#[must_use = "dropping the guard stops the background log writer"]
#[derive(Default)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize logging with the given configuration
///
/// Installs the global tracing subscriber; call once at startup and hold the
/// returned guard for the lifetime of the process.
///
/// # Example
///
/// ```no_run
/// use runstage_common::logging::{init_logging, LogConfig};
///
/// let config = LogConfig::from_env().unwrap();
/// let _guard = init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = LoggingGuard::default();

    if matches!(config.output, LogOutput::Console | LogOutput::Both) {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if matches!(config.output, LogOutput::File | LogOutput::Both) {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let file_appender =
            tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard._file_guard = Some(file_guard);
        layers.push(fmt_layer(config, non_blocking, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Build one formatting layer; files never get ANSI colours
fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
