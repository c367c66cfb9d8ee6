//! fps-probe: frame-rate measurement with layered fallback sources.
//!
//! [`FpsEngine`] answers "what is the current frame rate?" by trying, in
//! order, the frame-time report, display-driver counter files, the
//! compositor's frame counter and finally a vsync-driven estimate. It can
//! also push values to an observer on a fixed cadence.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod resolver;
pub mod sampler;
pub mod vsync;

#[cfg(test)]
mod test_support;

pub use config::{ConfigManager, EngineConfig};
pub use engine::FpsEngine;
pub use error::{ConfigError, DaemonError, ExecError, LoggingError, MonitorError, VsyncError};
pub use executor::{CommandExecutor, ShellExecutor, ERROR_SENTINEL};
pub use metrics::MetricsSnapshot;
pub use monitor::{FpsMonitor, Observer};
pub use sampler::{Sampler, Strategy};
pub use vsync::{SoftwareVsync, VsyncEstimator, VsyncSource};
