//! Pulse generator programming and start-time calibration.

use crate::clock::LocalClock;
use crate::config::PllConfig;
use crate::error::HardwareError;
use crate::hardware::PulseHardware;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Base clock of the pulse generator.
pub const PWM_BASE_FREQUENCY_HZ: f64 = 19_200_000.0;

/// Clock divider programmed into the generator.
pub const PWM_CLOCK_DIVIDER: u32 = 2;

/// Measured delay between the divider write and the first pulse edge.
pub const CLOCK_START_LATENCY_US: u64 = 111;

/// Widest acceptable bracket around the divider write.
pub const MAX_CALIBRATION_JITTER_US: u64 = 200;

/// Smallest range register value that still produces a pulse train.
const MIN_RANGE: f64 = 2.0;

/// Values established at calibration and shared with the phase controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PllRuntimeState {
    /// Pulse period in microseconds.
    pub period_us: f64,
    /// Frequency the capture device runs at when locked.
    pub fps_freq: f64,
    /// Local time of the first pulse edge.
    pub start_time: u64,
    /// Uncertainty of `start_time`.
    pub start_interval: u64,
}

impl PllRuntimeState {
    /// Spacing between the pulses frames are compared against.
    pub fn period_per_frame(&self, divider: u32) -> f64 {
        self.period_us / divider.max(1) as f64
    }
}

/// Register values for a target pulse frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PwmSettings {
    pub target_frequency_hz: f64,
    pub clock_divider: u32,
    pub range: u32,
    pub duty_register: u32,
    pub duty_cycle: f64,
    /// Pulse width after clamping to the period.
    pub pulse_width_ms: f64,
    pub target_period_ms: f64,
}

impl PwmSettings {
    /// Derive register values for `target_hz` with the given pulse width.
    ///
    /// Fails with `UnsupportedFrequency` when the range register cannot
    /// represent the frequency.
    pub fn derive(target_hz: f64, pulse_width_ms: f64) -> Result<Self, HardwareError> {
        let raw_range = PWM_BASE_FREQUENCY_HZ / (target_hz * PWM_CLOCK_DIVIDER as f64);
        if !raw_range.is_finite() || raw_range < MIN_RANGE || raw_range > u32::MAX as f64 {
            return Err(HardwareError::UnsupportedFrequency {
                hz: target_hz,
                range: raw_range,
            });
        }
        let range = raw_range as u32;

        let target_period_ms = 1_000.0 / target_hz;
        let pulse_width_ms = pulse_width_ms.clamp(0.0, target_period_ms);
        let duty_cycle = pulse_width_ms / target_period_ms;
        let duty_register = (duty_cycle * range as f64) as u32;

        Ok(Self {
            target_frequency_hz: target_hz,
            clock_divider: PWM_CLOCK_DIVIDER,
            range,
            duty_register,
            duty_cycle,
            pulse_width_ms,
            target_period_ms,
        })
    }

    /// Smallest representable change in pulse width.
    pub fn resolution_ms(&self) -> f64 {
        self.target_period_ms / self.range as f64
    }

    pub fn resolution_error_percent(&self) -> f64 {
        100.0 / self.range as f64
    }

    /// Pulse width the registers actually produce.
    pub fn realized_pulse_width_ms(&self) -> f64 {
        self.duty_register as f64 * self.target_period_ms / self.range as f64
    }

    /// Relative error between requested and realized pulse width.
    pub fn pulse_width_error(&self) -> f64 {
        if self.pulse_width_ms == 0.0 {
            0.0
        } else {
            (self.pulse_width_ms - self.realized_pulse_width_ms()) / self.pulse_width_ms
        }
    }
}

/// Result of the start-time measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StartTiming {
    pub start_time: u64,
    pub start_interval: u64,
    /// Width of the accepted bracket around the divider write.
    pub bracket_us: u64,
    pub iterations: u32,
    pub clock_resolution_ns: u64,
}

/// Everything produced by one calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub runtime: PllRuntimeState,
    pub settings: PwmSettings,
    pub timing: StartTiming,
    pub frame_rate_hz: f64,
    pub divider: u32,
}

/// Programs the generator and measures when its clock started.
#[derive(Debug, Clone, Copy)]
pub struct HardwareCalibrator {
    activation_latency_us: u64,
    max_jitter_us: u64,
    /// Unbounded when `None`.
    max_attempts: Option<u32>,
}

impl Default for HardwareCalibrator {
    fn default() -> Self {
        Self {
            activation_latency_us: CLOCK_START_LATENCY_US,
            max_jitter_us: MAX_CALIBRATION_JITTER_US,
            max_attempts: None,
        }
    }
}

impl HardwareCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up after `attempts` brackets that are too wide.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Write range and duty registers.
    pub fn program<H>(&self, settings: &PwmSettings, hardware: &mut H) -> Result<(), HardwareError>
    where
        H: PulseHardware + ?Sized,
    {
        hardware.configure_output()?;
        hardware.set_range(settings.range)?;
        hardware.set_duty_register(settings.duty_register)?;
        Ok(())
    }

    /// Start the pulse clock, retrying until the bracket around the divider
    /// write is narrow enough.
    ///
    /// Retries forever unless an attempt limit was set.
    pub fn measure_start<C, H>(&self, clock: &C, hardware: &mut H) -> Result<StartTiming, HardwareError>
    where
        C: LocalClock + ?Sized,
        H: PulseHardware + ?Sized,
    {
        let mut iterations = 0;
        loop {
            iterations += 1;
            let before = clock.now_micros();
            hardware.set_clock_divider(PWM_CLOCK_DIVIDER)?;
            let after = clock.now_micros();
            let bracket_us = after.saturating_sub(before);

            if bracket_us <= self.max_jitter_us {
                return Ok(StartTiming {
                    start_time: before + self.activation_latency_us,
                    start_interval: bracket_us.saturating_sub(self.activation_latency_us),
                    bracket_us,
                    iterations,
                    clock_resolution_ns: clock.resolution_nanos(),
                });
            }

            debug!(bracket_us, iterations, "Calibration bracket too wide, retrying");
            if self.max_attempts.is_some_and(|max| iterations >= max) {
                warn!(iterations, bracket_us, "Calibration did not converge");
                return Err(HardwareError::Pulse {
                    operation: "calibrate",
                    reason: format!(
                        "clock start bracket exceeded {}us for {} attempts",
                        self.max_jitter_us, iterations
                    ),
                });
            }
        }
    }

    /// Program the generator for `frame_rate_hz / divider` and measure the
    /// pulse train's start time.
    pub fn calibrate<C, H>(
        &self,
        config: &PllConfig,
        frame_rate_hz: f64,
        clock: &C,
        hardware: &mut H,
    ) -> Result<Calibration, HardwareError>
    where
        C: LocalClock + ?Sized,
        H: PulseHardware + ?Sized,
    {
        let divider = config.divider.max(1);
        let target_hz = frame_rate_hz / divider as f64;
        let settings = PwmSettings::derive(target_hz, config.pulse_width_ms)?;

        self.program(&settings, hardware)?;
        let timing = self.measure_start(clock, hardware)?;

        let runtime = PllRuntimeState {
            period_us: 1_000_000.0 / target_hz,
            fps_freq: target_hz * divider as f64,
            start_time: timing.start_time,
            start_interval: timing.start_interval,
        };

        Ok(Calibration {
            runtime,
            settings,
            timing,
            frame_rate_hz,
            divider,
        })
    }
}
