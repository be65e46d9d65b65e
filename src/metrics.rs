//! Lock quality metrics.
//!
//! Tracks update counts and decides whether the loop is locked.

use crate::controller::FrameUpdate;
use crate::offset::EstimateQuality;
use crate::pll::PllState;
use serde::{Deserialize, Serialize};

/// Smallest lock window, in microseconds. Used when both the offset bracket
/// and the calibration interval are tighter than this.
pub const MIN_LOCK_WINDOW_US: f64 = 100.0;

/// Half of the larger timing uncertainty, floored at `MIN_LOCK_WINDOW_US`.
pub fn lock_window_us(offset_interval_us: u64, start_interval_us: u64) -> f64 {
    let widest = offset_interval_us.max(start_interval_us) as f64;
    (widest / 2.0).max(MIN_LOCK_WINDOW_US)
}

/// Change of lock state reported by `PllMetrics::record_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    Lost,
}

/// Lock status exposed to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockStatus {
    pub state: PllState,
    pub locked: bool,
    /// Local time of the frame that acquired the current lock.
    pub locked_since_us: Option<i64>,
    pub frames: u64,
    pub rate_writes: u64,
    pub suppressed_writes: u64,
    pub degraded_offsets: u64,
    pub rejected_writes: u64,
    pub remote_clock_failures: u64,
    pub frame_rate_hz: f64,
    pub stabilized_error_us: f64,
    pub stability_us: f64,
    pub lock_window_us: f64,
    pub offset_us: i64,
    pub offset_interval_us: u64,
}

/// Per-session update counters.
#[derive(Debug, Clone, Default)]
pub struct PllMetrics {
    frames: u64,
    rate_writes: u64,
    suppressed_writes: u64,
    degraded_offsets: u64,
    rejected_writes: u64,
    remote_clock_failures: u64,
    sessions: u64,
    locked_since_us: Option<i64>,
    lock_window_us: f64,
    last: Option<FrameUpdate>,
}

impl PllMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear per-session counters. The session count is kept.
    pub fn begin_session(&mut self) {
        let sessions = self.sessions + 1;
        *self = Self {
            sessions,
            ..Self::default()
        };
    }

    /// Account for one controller update and re-evaluate the lock.
    pub fn record_update(
        &mut self,
        update: &FrameUpdate,
        start_interval_us: u64,
        primed: bool,
    ) -> Option<LockEvent> {
        self.frames += 1;
        if update.written {
            self.rate_writes += 1;
        } else {
            self.suppressed_writes += 1;
        }
        if update.offset_quality == EstimateQuality::Degraded {
            self.degraded_offsets += 1;
        }

        self.lock_window_us = lock_window_us(update.offset.accuracy_interval, start_interval_us);
        let locked = primed
            && update.stability.stabilized_error_us.abs() <= self.lock_window_us
            && update.stability.stability_us <= self.lock_window_us;
        self.last = Some(*update);

        match (locked, self.locked_since_us) {
            (true, None) => {
                self.locked_since_us = Some(update.phase.frame_local_us);
                Some(LockEvent::Acquired)
            }
            (false, Some(_)) => {
                self.locked_since_us = None;
                Some(LockEvent::Lost)
            }
            _ => None,
        }
    }

    /// A frame whose rate write was rejected by the capture device.
    pub fn record_rejected_write(&mut self) {
        self.frames += 1;
        self.rejected_writes += 1;
    }

    /// A frame dropped because the capture device clock could not be read.
    pub fn record_remote_clock_failure(&mut self) {
        self.frames += 1;
        self.remote_clock_failures += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    pub fn is_locked(&self) -> bool {
        self.locked_since_us.is_some()
    }

    pub fn status(&self, state: PllState) -> LockStatus {
        let last = self.last.as_ref();
        LockStatus {
            state,
            locked: self.is_locked(),
            locked_since_us: self.locked_since_us,
            frames: self.frames,
            rate_writes: self.rate_writes,
            suppressed_writes: self.suppressed_writes,
            degraded_offsets: self.degraded_offsets,
            rejected_writes: self.rejected_writes,
            remote_clock_failures: self.remote_clock_failures,
            frame_rate_hz: last.map_or(0.0, |u| u.frame_rate_hz),
            stabilized_error_us: last.map_or(0.0, |u| u.stability.stabilized_error_us),
            stability_us: last.map_or(0.0, |u| u.stability.stability_us),
            lock_window_us: self.lock_window_us,
            offset_us: last.map_or(0, |u| u.offset.offset),
            offset_interval_us: last.map_or(0, |u| u.offset.accuracy_interval),
        }
    }
}
