//! Vsync-driven frame-rate estimator.
//!
//! The estimator counts display refresh callbacks and recomputes a rate once
//! per elapsed second of callback time. It backs the last sampling strategy,
//! used when every other source abstains.
//!
//! The vsync delivery context is the only writer of the accumulator; readers
//! on other threads see it through atomic loads.

use crate::error::VsyncError;
use crate::sampler::format_fps;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Nanoseconds per second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Marks "no window start recorded yet".
const NO_TIMESTAMP: i64 = i64::MIN;

/// Callback invoked once per display refresh with a monotonic timestamp in ns.
pub type VsyncCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// A display refresh signal.
///
/// At most one callback is registered at a time. After `deregister` returns
/// the source must not invoke the callback again.
pub trait VsyncSource: Send + Sync {
    fn register(&self, callback: VsyncCallback) -> Result<(), VsyncError>;
    fn deregister(&self);
}

/// Accumulates vsync callbacks into a one-second-granularity rate.
#[derive(Debug)]
pub struct VsyncEstimator {
    active: AtomicBool,
    window_start: AtomicI64,
    frame_count: AtomicU64,
    rate_bits: AtomicU64,
}

impl VsyncEstimator {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            window_start: AtomicI64::new(NO_TIMESTAMP),
            frame_count: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Start accepting callbacks with a fresh window. The last rate is kept.
    pub fn activate(&self) {
        self.window_start.store(NO_TIMESTAMP, Ordering::SeqCst);
        self.frame_count.store(0, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    /// Stop accepting callbacks; later deliveries leave the state untouched.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Handle one vsync delivery. Returns the new rate when a window closed.
    pub fn on_vsync(&self, timestamp_ns: i64) -> Option<f64> {
        if !self.is_active() {
            return None;
        }
        self.record(timestamp_ns)
    }

    fn record(&self, timestamp_ns: i64) -> Option<f64> {
        let window_start = self.window_start.load(Ordering::Acquire);
        if window_start == NO_TIMESTAMP {
            self.window_start.store(timestamp_ns, Ordering::Release);
            return None;
        }

        let elapsed = timestamp_ns.saturating_sub(window_start);
        if elapsed <= 0 {
            trace!(timestamp_ns, window_start, "Ignoring out-of-order vsync");
            return None;
        }

        let count = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        if elapsed < NANOS_PER_SEC {
            return None;
        }

        let rate = count as f64 * NANOS_PER_SEC as f64 / elapsed as f64;
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
        self.frame_count.store(0, Ordering::Release);
        self.window_start.store(timestamp_ns, Ordering::Release);
        trace!(rate, count, elapsed, "Vsync window closed");
        Some(rate)
    }

    /// Last computed rate, 0.0 before the first full window.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /// Last computed rate formatted to one decimal place.
    pub fn current_fps(&self) -> String {
        format_fps(self.rate())
    }

    /// Callback forwarding deliveries into this estimator.
    pub fn callback(self: &Arc<Self>) -> VsyncCallback {
        let estimator = Arc::clone(self);
        Arc::new(move |timestamp_ns| {
            estimator.on_vsync(timestamp_ns);
        })
    }
}

impl Default for VsyncEstimator {
    fn default() -> Self {
        Self::new()
    }
}

struct VsyncWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Timer-driven vsync source for hosts without a display signal.
///
/// Delivers callbacks from a dedicated thread at a fixed nominal rate, with
/// timestamps measured on the monotonic clock.
pub struct SoftwareVsync {
    period: Duration,
    epoch: Instant,
    worker: Mutex<Option<VsyncWorker>>,
}

impl SoftwareVsync {
    pub fn new(rate_hz: u32) -> Result<Self, VsyncError> {
        if rate_hz == 0 {
            return Err(VsyncError::InvalidRate(rate_hz));
        }
        Ok(Self {
            period: Duration::from_nanos(NANOS_PER_SEC as u64 / rate_hz as u64),
            epoch: Instant::now(),
            worker: Mutex::new(None),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl VsyncSource for SoftwareVsync {
    fn register(&self, callback: VsyncCallback) -> Result<(), VsyncError> {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.is_some() {
            return Err(VsyncError::AlreadyRegistered);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let period = self.period;
        let epoch = self.epoch;

        let handle = std::thread::Builder::new()
            .name("software-vsync".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while !thread_stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    }
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    callback(epoch.elapsed().as_nanos() as i64);
                    next += period;
                    let now = Instant::now();
                    if next < now {
                        // Fell behind; skip the missed refreshes like a real display would.
                        next = now + period;
                    }
                }
            })?;

        info!(period_us = self.period.as_micros() as u64, "Software vsync started");
        *worker = Some(VsyncWorker { stop, handle });
        Ok(())
    }

    fn deregister(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.thread().id() != std::thread::current().id() {
                let _ = worker.handle.join();
            }
            debug!("Software vsync stopped");
        }
    }
}

impl Drop for SoftwareVsync {
    fn drop(&mut self) {
        self.deregister();
    }
}
