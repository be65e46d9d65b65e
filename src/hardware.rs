//! Collaborator interfaces consumed by the PLL.
//!
//! The capture device (remote clock, frame timestamps, frame-rate parameter)
//! and the pulse generator are owned outside the core. The lifecycle owns its
//! `PulseHardware` for the length of a session; capture-side collaborators
//! are borrowed per call.

use crate::error::HardwareError;

/// Clock of the capture device, in its own time domain.
pub trait RemoteClockSource {
    /// Query the remote clock in microseconds.
    ///
    /// Expected to round-trip in well under 100us; slower queries are
    /// rejected by the offset estimator's bracket check.
    fn remote_time_micros(&mut self) -> Result<u64, HardwareError>;
}

/// The capture device's frame-rate parameter.
pub trait CaptureParameterSink {
    /// Frame rate the device is currently configured for.
    fn frame_rate(&self) -> f64;

    /// Commit a new (already quantized) frame rate.
    fn set_frame_rate(&mut self, hz: f64) -> Result<(), HardwareError>;
}

/// A capture device as seen by the PLL: a remote clock plus a frame-rate knob.
pub trait CaptureDevice: RemoteClockSource + CaptureParameterSink {}

impl<T: RemoteClockSource + CaptureParameterSink> CaptureDevice for T {}

/// A completed frame, timestamped in the remote clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    pub remote_timestamp_us: u64,
}

impl FrameEvent {
    pub fn new(remote_timestamp_us: u64) -> Self {
        Self {
            remote_timestamp_us,
        }
    }
}

/// Hardware pulse generator (PWM block plus a reset line).
///
/// All calls are synchronous. `set_clock_divider` is the one with a
/// documented activation latency: the generator starts pulsing a fixed time
/// after the call begins, which the calibrator relies on.
pub trait PulseHardware {
    /// Put the pulse pin in mark-space PWM mode.
    fn configure_output(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    /// Set the base clock divider. Starts (or restarts) the pulse clock.
    fn set_clock_divider(&mut self, divider: u32) -> Result<(), HardwareError>;

    /// Set the number of clock ticks per pulse period.
    fn set_range(&mut self, range: u32) -> Result<(), HardwareError>;

    /// Set the number of ticks per period the output is high.
    fn set_duty_register(&mut self, ticks: u32) -> Result<(), HardwareError>;

    /// Force the pulse output to a static level. `false` silences the strobe.
    fn write_output(&mut self, level: bool) -> Result<(), HardwareError>;

    fn assert_reset(&mut self) -> Result<(), HardwareError>;

    fn release_reset(&mut self) -> Result<(), HardwareError>;
}

impl<H: PulseHardware + ?Sized> PulseHardware for Box<H> {
    fn configure_output(&mut self) -> Result<(), HardwareError> {
        (**self).configure_output()
    }

    fn set_clock_divider(&mut self, divider: u32) -> Result<(), HardwareError> {
        (**self).set_clock_divider(divider)
    }

    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        (**self).set_range(range)
    }

    fn set_duty_register(&mut self, ticks: u32) -> Result<(), HardwareError> {
        (**self).set_duty_register(ticks)
    }

    fn write_output(&mut self, level: bool) -> Result<(), HardwareError> {
        (**self).write_output(level)
    }

    fn assert_reset(&mut self) -> Result<(), HardwareError> {
        (**self).assert_reset()
    }

    fn release_reset(&mut self) -> Result<(), HardwareError> {
        (**self).release_reset()
    }
}
