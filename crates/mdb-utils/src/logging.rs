//! # Logging Utilities
//!
//! `tracing` subscriber setup shared by the mdb binaries.
//!
//! Console output goes to **stderr** so command output on stdout stays
//! pipeable. An optional daily-rolling file sink can be added alongside it.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directive (e.g. `RUST_LOG=mdb_core=trace`)
//! - `MDB_LOG_FORMAT`: `pretty` (default) or `json`
//! - `MDB_LOG_FILE`: path of an additional log file; the file rolls daily and
//!   gets a date suffix
//!
//! ## Example
//!
//! ```rust,no_run
//! use mdb_utils::{init_logging_with_level, LogFormat, LogLevel};
//!
//! let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)?;
//! tracing::debug!("logging ready");
//! # Ok::<(), mdb_utils::LoggingError>(())
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Selects the output format.
pub const FORMAT_VAR: &str = "MDB_LOG_FORMAT";

/// Optional log file path.
pub const FILE_VAR: &str = "MDB_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    /// Includes every Mach message and kernel call
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps the background file writer alive.
///
/// Buffered file output is flushed when this is dropped, so hold it for the
/// lifetime of `main`.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    file: Option<WorkerGuard>,
}

impl LoggingGuard
{
    /// True when a file sink is active.
    #[must_use]
    pub fn has_file(&self) -> bool
    {
        self.file.is_some()
    }
}

/// Initialize logging from the environment.
///
/// `RUST_LOG` sets the filter (default `warn`), `MDB_LOG_FORMAT` the format
/// and `MDB_LOG_FILE` an extra file sink.
///
/// ## Errors
///
/// - `InvalidFormat`: `MDB_LOG_FORMAT` is set to something unknown
/// - `InitializationFailed`: a global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(FORMAT_VAR) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };
    let directive = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| Level::WARN.to_string());
    install(format, &directive)
}

/// Initialize logging with an explicit level, ignoring `RUST_LOG`.
///
/// `MDB_LOG_FILE` is still honored.
///
/// ## Errors
///
/// `InitializationFailed` if a global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    install(format, &Level::from(level).to_string())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        LogFormat::Pretty => base.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Split `path` into the directory and file name prefix for the appender.
fn file_target(path: &Path) -> (PathBuf, PathBuf)
{
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let prefix = path.file_name().map_or_else(|| PathBuf::from("mdb.log"), PathBuf::from);
    (directory, prefix)
}

/// One filter per layer; an invalid directive falls back to `warn`.
fn filter(directive: &str) -> EnvFilter
{
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()))
}

fn install(format: LogFormat, directive: &str) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![layer(format, io::stderr, true, filter(directive))];

    let mut worker = None;
    if let Some(path) = env::var_os(FILE_VAR).map(PathBuf::from) {
        let (directory, prefix) = file_target(&path);
        std::fs::create_dir_all(&directory)?;
        let appender = tracing_appender::rolling::daily(directory, prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(layer(format, writer, false, filter(directive)));
        worker = Some(guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

    Ok(LoggingGuard { file: worker })
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
