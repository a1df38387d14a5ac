//! # Logging Utilities
//!
//! Logging infrastructure for Mantle using `tracing`.
//!
//! The engine itself only emits `tracing` events; this module decides where
//! they go. Symbol-table progress is logged at `debug`, individual runtime
//! records at `trace`, and skipped or deferred debug records at `warn`, so
//! `RUST_LOG=mantle_core=debug` is usually the right setting when chasing a
//! missing method.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=mantle_core::symbols=trace`)
//! - `MANTLE_LOG_FORMAT`: Set output format (`json` or `pretty`, default: `pretty`)
//! - `MANTLE_LOG_FILE`: Optional path to log file (if not set, logs only to stderr).
//!   A directory gets a dated `YYYY-MM-DD-mantle.log` inside it.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use mantle_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
//!     .expect("Failed to initialize logging");
//! tracing::info!("session started");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "MANTLE_LOG_FORMAT";
/// Environment variable naming an optional log file.
pub const LOG_FILE_ENV: &str = "MANTLE_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    Pretty,
    /// JSON format, one object per event
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
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
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

/// Initialize logging with default settings
///
/// Reads `RUST_LOG`, `MANTLE_LOG_FORMAT` and `MANTLE_LOG_FILE`. Console output
/// goes to stderr so that command output on stdout stays machine-readable.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the log file cannot
/// be opened.
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|s| LogFormat::from_str(&s).ok())
        .unwrap_or(LogFormat::Pretty);

    let default_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LogLevel>().ok())
        .map_or(Level::INFO, Into::into);

    let log_file = env::var(LOG_FILE_ENV).ok().map(|path| resolve_log_path(Path::new(&path)));
    init_logging_internal(format, default_level, log_file.as_deref())
}

/// Initialize logging with explicit level and format
///
/// ## Errors
///
/// Returns an error if logging is already initialized.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    init_logging_internal(format, level.into(), None)
}

/// Initialize logging that writes to `path` in addition to stderr.
///
/// The file is opened without rotation; the writer guard lives for the rest
/// of the process.
///
/// ## Errors
///
/// Returns an error if the parent directory cannot be created or logging is
/// already initialized.
pub fn init_logging_to_file(path: &Path, level: LogLevel) -> Result<(), LoggingError>
{
    let path = resolve_log_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    init_logging_internal(LogFormat::Pretty, level.into(), Some(&path))
}

/// `path` itself, or a file named after today's date if `path` is a directory.
#[must_use]
pub fn resolve_log_path(path: &Path) -> PathBuf
{
    if path.is_dir() {
        let today = Utc::now().format("%Y-%m-%d");
        path.join(format!("{today}-mantle.log"))
    } else {
        path.to_path_buf()
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard)
{
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_default();
    tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name))
}

fn init_logging_internal(format: LogFormat, default_level: Level, log_file: Option<&Path>) -> Result<(), LoggingError>
{
    // RUST_LOG can override the default level with more specific filters
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let result = match format {
        LogFormat::Pretty => {
            let console_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(true)
                .with_writer(io::stderr)
                .with_filter(env_filter.clone());

            if let Some(path) = log_file {
                let (non_blocking, guard) = file_writer(path);
                std::mem::forget(guard);
                let file_layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_filter(env_filter);
                Registry::default().with(console_layer).with(file_layer).try_init()
            } else {
                Registry::default().with(console_layer).try_init()
            }
        }
        LogFormat::Json => {
            let console_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stderr)
                .with_filter(env_filter.clone());

            if let Some(path) = log_file {
                let (non_blocking, guard) = file_writer(path);
                std::mem::forget(guard);
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_filter(env_filter);
                Registry::default().with(console_layer).with(file_layer).try_init()
            } else {
                Registry::default().with(console_layer).try_init()
            }
        }
    };

    result.map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(f)) if f == "xml"));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_resolve_log_path()
    {
        let file = Path::new("/nonexistent/mantle/session.log");
        assert_eq!(resolve_log_path(file), file.to_path_buf());

        let dated = resolve_log_path(&env::temp_dir());
        let name = dated.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-mantle.log"));
        assert_eq!(name.len(), "YYYY-MM-DD-mantle.log".len());
        assert_eq!(dated.parent(), Some(env::temp_dir().as_path()));
    }

    #[test]
    fn test_invalid_level_message_lists_choices()
    {
        let err = LogLevel::from_str("loud").unwrap_err();
        assert!(err.to_string().contains("'debug'"));
    }
}
