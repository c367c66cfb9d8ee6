//! Logging setup for the fps-probe daemon.
//!
//! JSON events go to stderr and to a daily-rotated file under the local data
//! directory (`~/.local/share/fps-probe/daemon.<date>.log` on Linux).
//! `RUST_LOG` overrides the default `info` filter.

use crate::error::LoggingError;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Directory name under the platform data directory
const LOG_DIR_NAME: &str = "fps-probe";
const LOG_FILE_PREFIX: &str = "daemon";
const LOG_FILE_SUFFIX: &str = "log";
/// Rotated files kept on disk
const MAX_LOG_FILES: usize = 3;
const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging() -> Result<LogGuard, LoggingError> {
    let log_dir = log_directory()?;
    prepare_log_directory(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(&log_dir)
        .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))?;

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(non_blocking_file);

    let stderr_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_writer(non_blocking_stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard {
        _file_guard: file_guard,
        _stderr_guard: stderr_guard,
    })
}

/// Where rotated log files live.
pub fn log_directory() -> Result<PathBuf, LoggingError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(LOG_DIR_NAME))
        .ok_or(LoggingError::DataDirectoryNotFound)
}

fn prepare_log_directory(dir: &Path) -> Result<(), LoggingError> {
    std::fs::create_dir_all(dir).map_err(|e| LoggingError::DirectoryCreationFailed {
        path: dir.display().to_string(),
        source: e,
    })
}

/// Keeps the non-blocking writers flushing. Hold it until shutdown.
pub struct LogGuard {
    _file_guard: WorkerGuard,
    _stderr_guard: WorkerGuard,
}
