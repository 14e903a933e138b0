use std::collections::VecDeque;

/// Weight of history in the decaying average and variance. Recent samples
/// carry the remaining weight.
const DECAY_FACTOR: f64 = 0.7;

/// Sliding statistics over a stream of samples.
///
/// Keeps a bounded window for the plain average and standard deviation, and
/// exponentially decaying counterparts (`davg`/`dsd`) that favor recent
/// samples. The decaying pair is what the director trusts for cycle times,
/// where old samples may describe a heap that no longer exists.
pub struct RateStats {
    window: VecDeque<f64>,
    window_max: usize,
    sum: f64,
    sum_sq: f64,
    count: u64,
    davg: f64,
    dvariance: f64,
}

impl RateStats {
    pub fn new(window_max: usize) -> Self {
        debug_assert!(window_max > 0);
        RateStats {
            window: VecDeque::with_capacity(window_max),
            window_max,
            sum: 0.0,
            sum_sq: 0.0,
            count: 0,
            davg: 0.0,
            dvariance: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.window_max {
            let evicted = self.window.pop_front().unwrap();
            self.sum -= evicted;
            self.sum_sq -= evicted * evicted;
        }
        self.window.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;

        if self.count == 0 {
            self.davg = value;
        } else {
            self.davg = (1.0 - DECAY_FACTOR) * value + DECAY_FACTOR * self.davg;
            let diff = value - self.davg;
            self.dvariance = (1.0 - DECAY_FACTOR) * diff * diff + DECAY_FACTOR * self.dvariance;
        }
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.sum / self.window.len() as f64
    }

    pub fn sd(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let avg = self.avg();
        let variance = self.sum_sq / self.window.len() as f64 - avg * avg;
        // Cancellation can push the computed variance slightly negative.
        variance.max(0.0).sqrt()
    }

    pub fn davg(&self) -> f64 {
        self.davg
    }

    pub fn dsd(&self) -> f64 {
        self.dvariance.max(0.0).sqrt()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
