//! Sampler metrics.
//!
//! Tracks which strategy served each query and how often the sampler had to
//! fall back to its cached value.

use crate::sampler::Strategy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Point-in-time view of the sampler counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total `sample()` calls
    pub total_queries: u64,
    pub frame_report_hits: u64,
    pub counter_file_hits: u64,
    pub counter_command_hits: u64,
    pub vsync_hits: u64,
    /// Queries answered from the cached estimate
    pub cache_fallbacks: u64,
    /// Strategy behind the most recent accepted value
    pub last_strategy: Option<Strategy>,
    pub uptime_sec: u64,
}

impl MetricsSnapshot {
    pub fn hits(&self, strategy: Strategy) -> u64 {
        match strategy {
            Strategy::FrameReport => self.frame_report_hits,
            Strategy::CounterFile => self.counter_file_hits,
            Strategy::CounterCommand => self.counter_command_hits,
            Strategy::Vsync => self.vsync_hits,
        }
    }
}

/// Lock-free counters updated on every sample.
pub struct SamplerMetrics {
    start_time: Instant,
    total_queries: AtomicU64,
    hits: [AtomicU64; 4],
    cache_fallbacks: AtomicU64,
    last_strategy: RwLock<Option<Strategy>>,
}

impl SamplerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_queries: AtomicU64::new(0),
            hits: Default::default(),
            cache_fallbacks: AtomicU64::new(0),
            last_strategy: RwLock::new(None),
        }
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, strategy: Strategy) {
        self.hits[strategy.index()].fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_strategy.write() {
            *last = Some(strategy);
        }
    }

    pub fn record_cache_fallback(&self) {
        self.cache_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = |strategy: Strategy| self.hits[strategy.index()].load(Ordering::Relaxed);

        MetricsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            frame_report_hits: hits(Strategy::FrameReport),
            counter_file_hits: hits(Strategy::CounterFile),
            counter_command_hits: hits(Strategy::CounterCommand),
            vsync_hits: hits(Strategy::Vsync),
            cache_fallbacks: self.cache_fallbacks.load(Ordering::Relaxed),
            last_strategy: self.last_strategy.read().map(|s| *s).unwrap_or(None),
            uptime_sec: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for SamplerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
