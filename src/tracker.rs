//! Jitter and stability statistics over the folded phase error.
//!
//! Four ring buffers are chained, each fed by the previous layer's running
//! mean:
//!
//! 1. raw error (5 samples): its mean is the jitter-filtered error;
//! 2. filtered error (10): its mean is the stabilized error;
//! 3. derivative of the stabilized error (10): close to zero at lock;
//! 4. mean of the derivative (10): its standard deviation is the stability
//!    indicator. Low means the loop is converged and not oscillating.

use crate::ring::RingBuffer;
use serde::{Deserialize, Serialize};

pub const JITTER_WINDOW: usize = 5;
pub const STABILITY_WINDOW: usize = 10;

/// Point-in-time view of the tracker, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilitySnapshot {
    pub samples: u64,
    pub raw_error_us: f64,
    pub smoothed_error_us: f64,
    pub stabilized_error_us: f64,
    pub derivative_us: f64,
    pub derivative_average_us: f64,
    pub stability_us: f64,
}

#[derive(Debug, Clone, Default)]
pub struct JitterStabilityTracker {
    raw: RingBuffer<JITTER_WINDOW>,
    averaged: RingBuffer<STABILITY_WINDOW>,
    derivative: RingBuffer<STABILITY_WINDOW>,
    derivative_average: RingBuffer<STABILITY_WINDOW>,
    previous_stabilized: Option<f64>,
    samples: u64,
}

impl JitterStabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one folded phase error (microseconds) through all four layers.
    pub fn record(&mut self, error_us: f64) -> StabilitySnapshot {
        self.raw.push(error_us);
        self.averaged.push(self.raw.mean());

        let stabilized = self.averaged.mean();
        let delta = self
            .previous_stabilized
            .map_or(0.0, |previous| stabilized - previous);
        self.previous_stabilized = Some(stabilized);

        self.derivative.push(delta);
        self.derivative_average.push(self.derivative.mean());
        self.samples += 1;

        self.snapshot()
    }

    /// Jitter-filtered error: mean of the raw window.
    pub fn smoothed_error(&self) -> f64 {
        self.raw.mean()
    }

    /// Mean of the filtered errors.
    pub fn stabilized_error(&self) -> f64 {
        self.averaged.mean()
    }

    /// Running mean of the stabilized error's derivative.
    pub fn derivative(&self) -> f64 {
        self.derivative.mean()
    }

    /// Variance of the derivative's running mean.
    pub fn variance(&self) -> f64 {
        self.derivative_average.variance()
    }

    /// Standard deviation of the derivative's running mean.
    pub fn stability(&self) -> f64 {
        self.derivative_average.std_dev()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// True once every layer holds a full window.
    pub fn is_primed(&self) -> bool {
        self.raw.is_full() && self.derivative_average.is_full()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            samples: self.samples,
            raw_error_us: self.raw.last().unwrap_or(0.0),
            smoothed_error_us: self.smoothed_error(),
            stabilized_error_us: self.stabilized_error(),
            derivative_us: self.derivative.last().unwrap_or(0.0),
            derivative_average_us: self.derivative(),
            stability_us: self.stability(),
        }
    }
}
