use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::rate::RateStats;

/// Samples the mutator allocation rate.
///
/// Mutators report allocated bytes with a single relaxed `fetch_add`; nothing
/// on the allocation path takes a lock. The director drains the counter once
/// per tick with [`sample_and_reset`](AllocRateSampler::sample_and_reset),
/// which converts the tick's byte count into a bytes-per-second sample. The
/// statistics window covers one second of samples.
pub struct AllocRateSampler {
    bytes_since_sample: AtomicUsize,
    sample_hz: u32,
    stats: Mutex<RateStats>,
}

impl AllocRateSampler {
    pub fn new(sample_hz: u32) -> Self {
        debug_assert!(sample_hz > 0);
        AllocRateSampler {
            bytes_since_sample: AtomicUsize::new(0),
            sample_hz,
            stats: Mutex::new(RateStats::new(sample_hz as usize)),
        }
    }

    /// Report `bytes` allocated by the calling mutator.
    pub fn record(&self, bytes: usize) {
        self.bytes_since_sample.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drain the counter and feed the resulting rate into the statistics.
    /// Returns the sampled rate in bytes per second. Called exactly once per
    /// director tick.
    pub fn sample_and_reset(&self) -> f64 {
        let bytes = self.bytes_since_sample.swap(0, Ordering::Relaxed);
        let bytes_per_second = bytes as f64 * self.sample_hz as f64;
        self.stats.lock().unwrap().add(bytes_per_second);
        bytes_per_second
    }

    /// Moving average of the sampled rate in bytes per second.
    pub fn avg(&self) -> f64 {
        self.stats.lock().unwrap().avg()
    }

    /// Standard deviation of the sampled rate in bytes per second.
    pub fn sd(&self) -> f64 {
        self.stats.lock().unwrap().sd()
    }
}
