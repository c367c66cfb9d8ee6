//! Frame-rate sampler.
//!
//! `Sampler::sample` walks a fixed list of strategies, cheapest-to-trust
//! first, and returns the first plausible value:
//!
//! 1. detailed per-frame report from a diagnostics command,
//! 2. raw `measured_fps` counter files,
//! 3. the compositor frame counter, differenced over time,
//! 4. the vsync estimator.
//!
//! A value is plausible when it is finite and strictly positive once
//! formatted to one decimal. Every failure inside a strategy counts as an
//! abstention; the sampler itself never fails and falls back to the last
//! accepted value.

use crate::executor::is_error_sentinel;
use crate::history::{FpsHistory, FpsSample};
use crate::metrics::{MetricsSnapshot, SamplerMetrics};
use crate::resolver::{is_command_failure, SourceResolver};
use crate::vsync::VsyncEstimator;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, trace};

/// Diagnostics command printing one record per rendered frame.
pub const DEFAULT_FRAME_REPORT_COMMAND: &str = "dumpsys gfxinfo";

/// Prefix of a per-frame record line in the frame report.
pub const FRAME_RECORD_PREFIX: &str = "Frame #";

/// Index of the duration field (ns) among a frame record's whitespace tokens.
pub const FRAME_DURATION_FIELD: usize = 3;

/// Marker of a frame report the executor was not allowed to produce.
pub const PERMISSION_DENIED_MARKER: &str = "Permission denied";

/// Value reported before anything has ever been measured.
pub const BASELINE_FPS: &str = "0.0";

/// Counter file contents that carry no measurement.
const TRIVIAL_READINGS: [&str; 3] = ["", "0", "N/A"];

/// Hex digits of the frame counter inside the introspection reply.
const FRAME_COUNTER_DIGITS: usize = 8;

/// Format a rate the way every reading is reported: one decimal place.
pub fn format_fps(fps: f64) -> String {
    format!("{:.1}", fps)
}

/// Parse a reported rate, rejecting non-finite values.
pub fn parse_fps(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Mean-frame-duration rate from a frame report, skipping malformed records.
pub fn parse_frame_report(report: &str) -> Option<f64> {
    let mut frames: u64 = 0;
    let mut total_ns: u128 = 0;

    for line in report.lines() {
        let line = line.trim_start();
        if !line.starts_with(FRAME_RECORD_PREFIX) {
            continue;
        }
        let Some(field) = line.split_whitespace().nth(FRAME_DURATION_FIELD) else {
            continue;
        };
        let Ok(duration_ns) = field.parse::<u64>() else {
            continue;
        };
        frames += 1;
        total_ns += duration_ns as u128;
    }

    if frames == 0 || total_ns == 0 {
        return None;
    }

    // 1e9 / mean frame duration
    Some(frames as f64 * 1e9 / total_ns as f64)
}

/// Positive rate from a counter file reading.
///
/// A bare number is taken as is; otherwise the first numeric token decides
/// (`"fps: 59.9 duration:..."`). Signs are kept, so a negative reading is
/// rejected rather than folded into a positive one.
pub fn parse_counter_reading(reading: &str) -> Option<f64> {
    let reading = reading.trim();
    if TRIVIAL_READINGS.contains(&reading) {
        return None;
    }
    parse_fps(reading)
        .or_else(|| {
            reading
                .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                .filter(|token| !token.is_empty())
                .find_map(parse_fps)
        })
        .filter(|fps| *fps > 0.0)
}

/// Frame counter encoded as 8 hex digits after the first `(` of the reply.
pub fn parse_frame_counter(reply: &str) -> Option<u32> {
    let start = reply.find('(')? + 1;
    let digits = reply.get(start..start + FRAME_COUNTER_DIGITS)?;
    u32::from_str_radix(digits, 16).ok()
}

/// One frame-rate source, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FrameReport,
    CounterFile,
    CounterCommand,
    Vsync,
}

impl Strategy {
    /// Order in which `Sampler::sample` tries the strategies.
    pub const ORDER: [Strategy; 4] = [
        Strategy::FrameReport,
        Strategy::CounterFile,
        Strategy::CounterCommand,
        Strategy::Vsync,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FrameReport => "frame_report",
            Strategy::CounterFile => "counter_file",
            Strategy::CounterCommand => "counter_command",
            Strategy::Vsync => "vsync",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Strategy::FrameReport => 0,
            Strategy::CounterFile => 1,
            Strategy::CounterCommand => 2,
            Strategy::Vsync => 3,
        }
    }
}

/// Millisecond clock used to difference frame counters.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Monotonic clock measured from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> i64 {
        // Offset by one so the very first reading is never at t=0.
        self.epoch.elapsed().as_millis() as i64 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterReading {
    time_ms: i64,
    frames: u64,
}

/// Last observed (time, frame counter) pair for finite differencing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    last: Option<CounterReading>,
}

impl CounterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a counter reading and derive `(Δframes / Δms) * 1000`.
    ///
    /// The first reading only seeds the state. A non-advancing clock yields
    /// nothing and leaves the state alone. A counter that went backwards
    /// (driver reset or wrap) reseeds.
    pub fn observe(&mut self, frames: u64, time_ms: i64) -> Option<f64> {
        let current = CounterReading { time_ms, frames };
        let Some(previous) = self.last else {
            self.last = Some(current);
            return None;
        };

        let elapsed_ms = time_ms - previous.time_ms;
        if elapsed_ms <= 0 {
            return None;
        }

        if frames < previous.frames {
            debug!(previous = previous.frames, frames, "Frame counter went backwards, reseeding");
            self.last = Some(current);
            return None;
        }

        let rate = (frames - previous.frames) as f64 / elapsed_ms as f64 * 1000.0;
        self.last = Some(current);
        Some(rate)
    }

    pub fn has_reading(&self) -> bool {
        self.last.is_some()
    }
}

/// Layered frame-rate sampler.
pub struct Sampler {
    resolver: Arc<SourceResolver>,
    estimator: Arc<VsyncEstimator>,
    frame_report_command: String,
    clock: Arc<dyn Clock>,
    counter_state: Mutex<CounterState>,
    cached: RwLock<String>,
    history: Mutex<FpsHistory>,
    metrics: SamplerMetrics,
}

impl Sampler {
    pub fn new(
        resolver: Arc<SourceResolver>,
        estimator: Arc<VsyncEstimator>,
        frame_report_command: impl Into<String>,
        history_capacity: usize,
    ) -> Self {
        Self {
            resolver,
            estimator,
            frame_report_command: frame_report_command.into(),
            clock: Arc::new(MonotonicClock::new()),
            counter_state: Mutex::new(CounterState::new()),
            cached: RwLock::new(BASELINE_FPS.to_string()),
            history: Mutex::new(FpsHistory::with_capacity(history_capacity)),
            metrics: SamplerMetrics::new(),
        }
    }

    /// Replace the clock used for counter differencing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(&self) -> &Arc<SourceResolver> {
        &self.resolver
    }

    /// Current frame rate, one decimal place. Never fails.
    pub fn sample(&self) -> String {
        self.metrics.record_query();

        for strategy in Strategy::ORDER {
            let attempt = std::panic::catch_unwind(AssertUnwindSafe(|| self.attempt(strategy)));
            let candidate = match attempt {
                Ok(candidate) => candidate,
                Err(_) => {
                    debug!(strategy = strategy.name(), "Strategy panicked, treating as abstention");
                    None
                }
            };

            if let Some(value) = candidate.and_then(accept) {
                self.store(strategy, &value);
                trace!(strategy = strategy.name(), fps = %value, "Sample accepted");
                return value;
            }
            trace!(strategy = strategy.name(), "Strategy abstained");
        }

        self.metrics.record_cache_fallback();
        self.cached_estimate()
    }

    /// Run a single strategy, without acceptance filtering or caching.
    pub fn attempt(&self, strategy: Strategy) -> Option<f64> {
        match strategy {
            Strategy::FrameReport => self.frame_report_fps(),
            Strategy::CounterFile => self.counter_file_fps(),
            Strategy::CounterCommand => self.counter_command_fps(),
            Strategy::Vsync => self.vsync_fps(),
        }
    }

    fn frame_report_fps(&self) -> Option<f64> {
        let report = self.resolver.executor().execute(&self.frame_report_command);
        if report.is_empty()
            || is_error_sentinel(&report)
            || report.contains(PERMISSION_DENIED_MARKER)
        {
            return None;
        }
        parse_frame_report(&report)
    }

    fn counter_file_fps(&self) -> Option<f64> {
        let fixed = self.resolver.counter_paths();
        let resolved = self
            .resolver
            .resolve_counter_path()
            .filter(|path| !fixed.iter().any(|p| p == path));

        fixed
            .iter()
            .map(String::as_str)
            .chain(resolved)
            .find_map(|path| self.read_counter_file(path))
    }

    fn read_counter_file(&self, path: &str) -> Option<f64> {
        let executor = self.resolver.executor();
        if !executor.exists(path) {
            return None;
        }
        let reading = executor.execute(&format!("cat {}", path));
        if is_error_sentinel(&reading) {
            return None;
        }
        parse_counter_reading(&reading)
    }

    fn counter_command_fps(&self) -> Option<f64> {
        if !self.resolver.probe_command_availability() {
            return None;
        }

        let reply = self
            .resolver
            .executor()
            .execute(self.resolver.counter_command());
        if is_command_failure(&reply) {
            self.resolver.disable_command(&reply);
            return None;
        }

        let frames = parse_frame_counter(&reply)?;
        let now = self.clock.now_millis();
        self.counter_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(frames as u64, now)
    }

    fn vsync_fps(&self) -> Option<f64> {
        parse_fps(&self.estimator.current_fps())
    }

    fn store(&self, strategy: Strategy, value: &str) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = value.to_string();
        }
        if let (Some(fps), Ok(mut history)) = (parse_fps(value), self.history.lock()) {
            history.push(FpsSample::new(fps, strategy));
        }
        self.metrics.record_hit(strategy);
    }

    /// Last accepted value, or the baseline if nothing was ever accepted.
    pub fn cached_estimate(&self) -> String {
        self.cached
            .read()
            .map(|cached| cached.clone())
            .unwrap_or_else(|_| BASELINE_FPS.to_string())
    }

    /// Mean of the recently accepted values, 0.0 when none.
    pub fn smoothed_fps(&self) -> f64 {
        self.history
            .lock()
            .map(|history| history.average())
            .unwrap_or(0.0)
    }

    /// Number of readings currently in the smoothing window.
    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .map(|history| history.len())
            .unwrap_or(0)
    }

    /// Rate at percentile `p` (0.0..=1.0) of the recent samples.
    pub fn low_fps(&self, p: f64) -> f64 {
        self.history
            .lock()
            .map(|history| history.percentile(p))
            .unwrap_or(0.0)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Format and keep a candidate only if it reads as a positive rate.
fn accept(fps: f64) -> Option<String> {
    let value = format_fps(fps);
    parse_fps(&value).filter(|v| *v > 0.0).map(|_| value)
}
