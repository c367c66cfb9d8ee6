//! Frame-rate engine facade.
//!
//! Wires the resolver, sampler, vsync estimator and monitor together around
//! one executor and one vsync source. This is the type callers hold.

use crate::config::EngineConfig;
use crate::error::MonitorError;
use crate::executor::CommandExecutor;
use crate::metrics::MetricsSnapshot;
use crate::monitor::FpsMonitor;
use crate::resolver::SourceResolver;
use crate::sampler::{parse_fps, Clock, Sampler};
use crate::vsync::{VsyncEstimator, VsyncSource};
use std::sync::Arc;
use std::time::Duration;

/// Percentile used for the "1% low" figure.
const LOW_PERCENTILE: f64 = 0.01;

/// Frame-rate measurement engine.
///
/// Two engines must not share one executor session or counter file without
/// outside coordination.
pub struct FpsEngine {
    config: EngineConfig,
    resolver: Arc<SourceResolver>,
    estimator: Arc<VsyncEstimator>,
    sampler: Arc<Sampler>,
    monitor: FpsMonitor,
}

impl FpsEngine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        vsync: Arc<dyn VsyncSource>,
    ) -> Self {
        Self::build(config, executor, vsync, None)
    }

    /// Like `new`, with an explicit clock for frame-counter differencing.
    pub fn with_clock(
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        vsync: Arc<dyn VsyncSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(config, executor, vsync, Some(clock))
    }

    fn build(
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        vsync: Arc<dyn VsyncSource>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let resolver = Arc::new(SourceResolver::from_config(executor, &config));
        let estimator = Arc::new(VsyncEstimator::new());

        let mut sampler = Sampler::new(
            Arc::clone(&resolver),
            Arc::clone(&estimator),
            config.frame_report_command.clone(),
            config.history_capacity,
        );
        if let Some(clock) = clock {
            sampler = sampler.with_clock(clock);
        }
        let sampler = Arc::new(sampler);

        let monitor = FpsMonitor::new(
            Arc::clone(&sampler),
            Arc::clone(&estimator),
            vsync,
            Duration::from_millis(config.refresh_interval_ms),
        );

        Self {
            config,
            resolver,
            estimator,
            sampler,
            monitor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current frame rate, one decimal place. Blocks on the executor.
    pub fn current_fps(&self) -> String {
        self.sampler.sample()
    }

    /// Numeric view of `current_fps`, 0.0 when unparseable.
    pub fn fps(&self) -> f64 {
        parse_fps(&self.current_fps()).unwrap_or(0.0)
    }

    /// Last accepted value without sampling.
    pub fn cached_fps(&self) -> String {
        self.sampler.cached_estimate()
    }

    pub fn smoothed_fps(&self) -> f64 {
        self.sampler.smoothed_fps()
    }

    pub fn low_fps(&self) -> f64 {
        self.sampler.low_fps(LOW_PERCENTILE)
    }

    /// Readings behind `smoothed_fps` and `low_fps`.
    pub fn history_len(&self) -> usize {
        self.sampler.history_len()
    }

    /// Latest vsync estimate, independent of the other strategies.
    pub fn vsync_fps(&self) -> String {
        self.estimator.current_fps()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.sampler.metrics()
    }

    pub fn counter_path(&self) -> Option<&str> {
        self.resolver.resolve_counter_path()
    }

    pub fn command_available(&self) -> bool {
        self.resolver.probe_command_availability()
    }

    /// Replace the monitoring observer.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.monitor.set_observer(Arc::new(observer));
    }

    /// Start periodic monitoring. `Ok(false)` when already running.
    pub fn start_monitoring<F>(&self, observer: F) -> Result<bool, MonitorError>
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.monitor.start(Arc::new(observer))
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Stop monitoring and release the executor session. Terminal.
    pub fn destroy(&self) {
        self.monitor.destroy();
    }
}
