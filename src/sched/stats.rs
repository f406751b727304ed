//! Running statistics over scheduler round durations.
//!
//! Welford's online algorithm: one pass, O(1) memory, numerically stable.
//! Purely observational — nothing in the scheduler reads these back.

use serde::Serialize;

use super::Time;

/// Mean / standard deviation / extrema of a stream of durations, in the
/// unit of the scheduler's time source.
#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: Time,
    max: Time,
}

impl RoundStats {
    /// Empty statistics.
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: Time::MAX,
            max: Time::MIN,
        }
    }

    /// Feed one sample.
    pub fn add(&mut self, sample: Time) {
        self.count += 1;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        let value = sample as f64;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Number of samples seen since creation or the last reset.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Arithmetic mean, or 0 with no samples.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance, or 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Smallest sample, if any.
    pub fn min(&self) -> Option<Time> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest sample, if any.
    pub fn max(&self) -> Option<Time> {
        (self.count > 0).then_some(self.max)
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for RoundStats {
    fn default() -> Self {
        Self::new()
    }
}
