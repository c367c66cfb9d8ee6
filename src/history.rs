//! Smoothing window over accepted frame-rate readings.
//!
//! Every value the sampler accepts is pushed here together with the
//! strategy that produced it, so callers can ask for a steadier number than
//! the latest single reading.

use crate::sampler::Strategy;
use std::collections::VecDeque;

/// Default smoothing window (120 samples = 2 minutes at the 1s monitor cadence).
pub const HISTORY_CAPACITY: usize = 120;

/// One accepted reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f64,
    pub strategy: Strategy,
}

impl FpsSample {
    pub fn new(fps: f64, strategy: Strategy) -> Self {
        Self { fps, strategy }
    }
}

/// Fixed-capacity ring buffer; the oldest reading is evicted first.
#[derive(Debug)]
pub struct FpsHistory {
    samples: VecDeque<FpsSample>,
    capacity: usize,
}

impl FpsHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// A zero capacity is bumped to one so the latest reading is always kept.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: FpsSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean rate over the window, 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|s| s.fps).sum();
        sum / self.samples.len() as f64
    }

    /// Rate at percentile `p` (clamped to 0.0..=1.0), 0.0 when empty.
    ///
    /// Low percentiles give the "1% low" style figure: `percentile(0.01)`.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }

        let mut rates: Vec<f64> = self.samples.iter().map(|s| s.fps).collect();
        rates.sort_unstable_by(|a, b| a.total_cmp(b));

        let index = ((rates.len() as f64 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
        rates[index]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for FpsHistory {
    fn default() -> Self {
        Self::new()
    }
}
