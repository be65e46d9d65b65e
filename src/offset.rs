//! Clock-domain offset estimation.
//!
//! The capture device timestamps frames with its own clock. To compare those
//! timestamps with pulse edges we need `local - remote`, which is measured by
//! bracketing a remote clock query between two local timestamps and filtered
//! with a first-order EMA.

use crate::clock::LocalClock;
use crate::error::HardwareError;
use crate::hardware::RemoteClockSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Widest accepted bracket around a remote query, in microseconds.
pub const MAX_BRACKET_US: u64 = 150;

/// Attempts allowed before any estimate exists.
pub const FIRST_ESTIMATE_ATTEMPTS: u32 = 50;

/// Attempts allowed per call once an estimate exists (called every frame).
pub const ESTIMATE_ATTEMPTS: u32 = 5;

/// EMA rate applied to each new sample.
pub const EMA_RATE: f64 = 0.1;

/// Offset between the local and remote clock domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// `local - remote`, in microseconds.
    pub offset: i64,
    /// Width of the bracket the offset was measured with, in microseconds.
    pub accuracy_interval: u64,
}

impl ClockOffset {
    /// Translate a remote-domain timestamp into the local domain.
    pub fn to_local(&self, remote_us: u64) -> i64 {
        remote_us as i64 + self.offset
    }
}

/// Whether the last call produced a fresh sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateQuality {
    /// A sample within the bracket bound was blended in.
    Fresh,
    /// No sample met the bound; the previous estimate was kept.
    Degraded,
}

#[derive(Debug, Clone, Copy)]
struct BracketSample {
    local_before: u64,
    remote: u64,
    width: u64,
}

impl BracketSample {
    fn offset(&self) -> ClockOffset {
        ClockOffset {
            offset: self.local_before as i64 - self.remote as i64,
            accuracy_interval: self.width,
        }
    }
}

/// Per-instance offset estimator.
#[derive(Debug, Clone, Default)]
pub struct ClockOffsetEstimator {
    current: Option<ClockOffset>,
    last_quality: Option<EstimateQuality>,
    fresh_samples: u64,
    degraded_samples: u64,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current estimate, if one has been made.
    pub fn current(&self) -> Option<ClockOffset> {
        self.current
    }

    pub fn last_quality(&self) -> Option<EstimateQuality> {
        self.last_quality
    }

    pub fn fresh_samples(&self) -> u64 {
        self.fresh_samples
    }

    pub fn degraded_samples(&self) -> u64 {
        self.degraded_samples
    }

    /// Forget the current estimate; the next call gets the long retry budget.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Measure the offset and fold it into the running estimate.
    ///
    /// Never fails because of a wide bracket: when every attempt is too wide
    /// the previous estimate is returned unchanged. Before any estimate
    /// exists the tightest sample is returned without being stored. Only a
    /// failing remote query is an error.
    pub fn estimate<C, R>(&mut self, clock: &C, remote: &mut R) -> Result<ClockOffset, HardwareError>
    where
        C: LocalClock + ?Sized,
        R: RemoteClockSource + ?Sized,
    {
        let attempts = if self.current.is_some() {
            ESTIMATE_ATTEMPTS
        } else {
            FIRST_ESTIMATE_ATTEMPTS
        };

        let mut tightest: Option<BracketSample> = None;
        let mut accepted: Option<BracketSample> = None;

        for _ in 0..attempts {
            let local_before = clock.now_micros();
            let remote_us = remote.remote_time_micros()?;
            let local_after = clock.now_micros();

            let sample = BracketSample {
                local_before,
                remote: remote_us,
                width: local_after.saturating_sub(local_before),
            };

            if sample.width <= MAX_BRACKET_US {
                accepted = Some(sample);
                break;
            }
            if tightest.map_or(true, |t| sample.width < t.width) {
                tightest = Some(sample);
            }
        }

        let estimate = match (accepted, self.current) {
            (Some(sample), None) => {
                self.record(EstimateQuality::Fresh);
                sample.offset()
            }
            (Some(sample), Some(previous)) => {
                self.record(EstimateQuality::Fresh);
                blend(previous, sample.offset())
            }
            (None, Some(previous)) => {
                debug!(
                    attempts,
                    tightest_bracket_us = tightest.map(|t| t.width),
                    offset_us = previous.offset,
                    "Offset bracket bound not met, keeping previous estimate"
                );
                self.record(EstimateQuality::Degraded);
                return Ok(previous);
            }
            (None, None) => {
                // Used for this frame only. The next call still gets the long
                // budget and adopts its first good sample outright.
                let fallback = tightest.map(|t| t.offset()).unwrap_or_default();
                warn!(
                    attempts,
                    bracket_us = fallback.accuracy_interval,
                    "No tight offset bracket on first estimate, using best sample for this frame"
                );
                self.record(EstimateQuality::Degraded);
                return Ok(fallback);
            }
        };

        self.current = Some(estimate);
        Ok(estimate)
    }

    fn record(&mut self, quality: EstimateQuality) {
        match quality {
            EstimateQuality::Fresh => self.fresh_samples += 1,
            EstimateQuality::Degraded => self.degraded_samples += 1,
        }
        self.last_quality = Some(quality);
    }
}

fn blend(previous: ClockOffset, sample: ClockOffset) -> ClockOffset {
    let offset = (1.0 - EMA_RATE) * previous.offset as f64 + EMA_RATE * sample.offset as f64;
    let interval = (1.0 - EMA_RATE) * previous.accuracy_interval as f64
        + EMA_RATE * sample.accuracy_interval as f64;
    ClockOffset {
        offset: offset.round() as i64,
        accuracy_interval: interval.round() as u64,
    }
}
