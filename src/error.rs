//! Error types for fps-probe.
//!
//! Sampling itself never fails; these enums cover the caller-facing edges:
//! the shell session, vsync registration, the monitor, configuration and logging.

use thiserror::Error;

/// Errors raised by the shell session behind `ShellExecutor`.
///
/// These never escape `CommandExecutor::execute`, which maps them to the
/// error sentinel, but they are logged with this context.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn shell '{shell}': {source}")]
    SpawnFailed {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shell session closed before the command finished")]
    SessionClosed,

    #[error("Command did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Shell session pipe unavailable: {0}")]
    PipeUnavailable(&'static str),

    #[error("Shell I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to vsync registration.
#[derive(Error, Debug)]
pub enum VsyncError {
    #[error("A vsync callback is already registered with this source")]
    AlreadyRegistered,

    #[error("Invalid vsync rate {0}Hz")]
    InvalidRate(u32),

    #[error("Failed to start vsync delivery thread: {0}")]
    ThreadSpawnFailed(#[from] std::io::Error),
}

/// Errors related to the monitor loop.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("No tokio runtime available to drive the monitor loop")]
    NoRuntime,
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine a local data directory for logs")]
    DataDirectoryNotFound,

    #[error("Failed to create log directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    AppenderCreationFailed(String),
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Vsync error: {0}")]
    Vsync(#[from] VsyncError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
