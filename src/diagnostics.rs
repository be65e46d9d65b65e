//! Human-readable reports for the verbose log.

use crate::calibrator::Calibration;
use crate::config::PllConfig;
use crate::controller::FrameUpdate;
use std::fmt;

/// One line per controller update.
pub struct UpdateLine<'a> {
    update: &'a FrameUpdate,
    start_interval_us: u64,
}

impl<'a> UpdateLine<'a> {
    pub fn new(update: &'a FrameUpdate, start_interval_us: u64) -> Self {
        Self {
            update,
            start_interval_us,
        }
    }
}

impl fmt::Display for UpdateLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let update = self.update;
        write!(
            f,
            "diff={:>7.0}us ({:>7.3}%) fps={:>9.5}Hz [{}/{}]",
            update.phase.diff_us,
            update.phase.fraction * 100.0,
            update.frame_rate_hz,
            update.offset.accuracy_interval,
            self.start_interval_us,
        )?;
        if !update.written {
            write!(f, " same rate")?;
        }
        Ok(())
    }
}

/// Multi-line dump of the PLL settings.
pub struct SettingsSummary<'a>(pub &'a PllConfig);

impl fmt::Display for SettingsSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        writeln!(f, "PLL enabled     : {}", config.enabled)?;
        writeln!(f, "Divider         : {}", config.divider)?;
        writeln!(f, "Phase offset    : {}us", config.phase_offset_us)?;
        writeln!(f, "Pulse width     : {:.5}ms", config.pulse_width_ms)?;
        match config.calibration_attempts {
            Some(attempts) => writeln!(f, "Calibration     : {} attempts", attempts)?,
            None => writeln!(f, "Calibration     : until settled")?,
        }
        write!(f, "Controller      : {}", config.controller.name())
    }
}

/// Register values and start-time measurement of one calibration.
pub struct CalibrationReport<'a>(pub &'a Calibration);

impl fmt::Display for CalibrationReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Calibration {
            runtime,
            settings,
            timing,
            frame_rate_hz,
            divider,
        } = self.0;

        writeln!(f, "Frame rate      : {:.3}Hz / {}", frame_rate_hz, divider)?;
        writeln!(
            f,
            "Target          : {:.5}Hz ({:.5}ms)",
            settings.target_frequency_hz, settings.target_period_ms
        )?;
        writeln!(
            f,
            "Range           : {} (resolution {:.6}ms, {:.5}%)",
            settings.range,
            settings.resolution_ms(),
            settings.resolution_error_percent()
        )?;
        writeln!(
            f,
            "Pulse width     : {:.5}ms requested, {:.5}ms realized ({:.3}%)",
            settings.pulse_width_ms,
            settings.realized_pulse_width_ms(),
            settings.pulse_width_error() * 100.0
        )?;
        writeln!(
            f,
            "Duty            : {} ({:.3}%)",
            settings.duty_register,
            settings.duty_cycle * 100.0
        )?;
        writeln!(f, "Clock res       : {}ns", timing.clock_resolution_ns)?;
        writeln!(
            f,
            "Calibration     : {} attempts, bracket {}us",
            timing.iterations, timing.bracket_us
        )?;
        write!(
            f,
            "Start time      : {}us +{}us, locked rate {:.5}Hz",
            runtime.start_time, runtime.start_interval, runtime.fps_freq
        )
    }
}
