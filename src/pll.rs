//! PLL lifecycle.
//!
//! `FlashPll` owns the pulse hardware for its whole life and borrows the
//! capture device per call. States move
//! `Uninitialized -> Calibrating -> Active -> Stopped`, and `Stopped` can be
//! started again. A missing privilege at construction is permanent: every
//! later operation fails with `PllError::Initialization`.

use crate::calibrator::{Calibration, HardwareCalibrator, PllRuntimeState};
use crate::clock::{has_hardware_access, LocalClock, MonotonicClock};
use crate::config::PllConfig;
use crate::controller::{FrameUpdate, PhaseController};
use crate::diagnostics::{CalibrationReport, SettingsSummary};
use crate::error::{HardwareError, InitError, PllError};
use crate::hardware::{CaptureDevice, CaptureParameterSink, FrameEvent, PulseHardware};
use crate::metrics::{LockEvent, LockStatus, PllMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Time the reset line is held asserted.
pub const RESET_SETTLE_US: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PllState {
    Uninitialized,
    Calibrating,
    Active,
    Stopped,
}

impl fmt::Display for PllState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PllState::Uninitialized => "uninitialized",
            PllState::Calibrating => "calibrating",
            PllState::Active => "active",
            PllState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State that only exists while the loop is running.
#[derive(Debug)]
struct Session {
    calibration: Calibration,
    controller: PhaseController,
}

/// A flash PLL bound to one pulse generator.
pub struct FlashPll<H: PulseHardware, C: LocalClock = MonotonicClock> {
    config: PllConfig,
    hardware: H,
    clock: C,
    calibrator: HardwareCalibrator,
    init_error: Option<InitError>,
    state: PllState,
    session: Option<Session>,
    metrics: PllMetrics,
}

impl<H: PulseHardware> FlashPll<H, MonotonicClock> {
    /// Create a PLL on the system monotonic clock.
    ///
    /// Checks for root privileges and resets the pulse line. Failures are
    /// recorded, not returned; see `initialization_error`.
    pub fn new(config: PllConfig, hardware: H) -> Self {
        Self::with_clock(config, hardware, MonotonicClock::new(), has_hardware_access())
    }
}

impl<H: PulseHardware, C: LocalClock> FlashPll<H, C> {
    /// Create a PLL on an explicit clock.
    ///
    /// `hardware_access` stands in for the privilege check; simulated pulse
    /// outputs need no register access.
    pub fn with_clock(config: PllConfig, hardware: H, clock: C, hardware_access: bool) -> Self {
        let calibrator = match config.calibration_attempts {
            Some(attempts) => HardwareCalibrator::new().with_max_attempts(attempts),
            None => HardwareCalibrator::new(),
        };
        let mut pll = Self {
            config,
            hardware,
            clock,
            calibrator,
            init_error: None,
            state: PllState::Uninitialized,
            session: None,
            metrics: PllMetrics::new(),
        };

        if !hardware_access {
            error!("Flash PLL requires root privileges for pulse hardware access");
            pll.init_error = Some(InitError::PrivilegeRequired);
            return pll;
        }

        let setup = pll
            .hardware
            .configure_output()
            .and_then(|_| pll.pulse_reset());
        if let Err(e) = setup {
            error!(error = %e, "Pulse hardware setup failed");
            pll.init_error = Some(InitError::HardwareSetup(e.to_string()));
        }

        if pll.config.verbose {
            info!("Flash PLL settings:\n{}", SettingsSummary(&pll.config));
        }
        pll
    }

    pub fn state(&self) -> PllState {
        self.state
    }

    pub fn config(&self) -> &PllConfig {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn initialization_error(&self) -> Option<&InitError> {
        self.init_error.as_ref()
    }

    /// Runtime values of the current session.
    pub fn runtime(&self) -> Option<&PllRuntimeState> {
        self.session.as_ref().map(|s| &s.calibration.runtime)
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.session.as_ref().map(|s| &s.calibration)
    }

    pub fn controller(&self) -> Option<&PhaseController> {
        self.session.as_ref().map(|s| &s.controller)
    }

    pub fn lock_status(&self) -> LockStatus {
        self.metrics.status(self.state)
    }

    /// Calibrate the pulse generator for `frame_rate_hz` and start locking.
    ///
    /// A disabled configuration is accepted and does nothing.
    pub fn start(&mut self, frame_rate_hz: f64) -> Result<(), PllError> {
        self.check_initialized()?;
        if self.state == PllState::Active {
            return Err(PllError::invalid_state("start", self.state));
        }
        if !self.config.enabled {
            debug!("Flash PLL disabled, not starting");
            return Ok(());
        }
        self.config.validate()?;

        let previous = self.state;
        self.state = PllState::Calibrating;

        let calibration = match self.pulse_reset().and_then(|_| {
            self.calibrator
                .calibrate(&self.config, frame_rate_hz, &self.clock, &mut self.hardware)
        }) {
            Ok(calibration) => calibration,
            Err(e) => {
                warn!(error = %e, frame_rate_hz, "Flash PLL calibration failed");
                self.state = previous;
                return Err(e.into());
            }
        };

        info!(
            frame_rate_hz,
            divider = calibration.divider,
            start_time_us = calibration.runtime.start_time,
            start_interval_us = calibration.runtime.start_interval,
            "Flash PLL calibrated"
        );
        if self.config.verbose {
            info!("Calibration:\n{}", CalibrationReport(&calibration));
        }

        let controller = PhaseController::new(&self.config);
        if controller.mode() == "step_response" {
            warn!("Flash PLL in step response mode: frame rate follows a fixed plan, not the pulse phase");
        }

        self.session = Some(Session {
            calibration,
            controller,
        });
        self.metrics.begin_session();
        self.state = PllState::Active;
        Ok(())
    }

    /// Feed one completed frame through the controller.
    pub fn update<D>(&mut self, device: &mut D, frame: FrameEvent) -> Result<FrameUpdate, PllError>
    where
        D: CaptureDevice + ?Sized,
    {
        self.check_initialized()?;
        let session = match (self.state, self.session.as_mut()) {
            (PllState::Active, Some(session)) => session,
            (state, _) => return Err(PllError::invalid_state("update", state)),
        };

        let runtime = session.calibration.runtime;
        let result = session
            .controller
            .update(&runtime, frame, &self.clock, device);
        let primed = session.controller.tracker().is_primed();

        let update = match result {
            Ok(update) => update,
            Err(e) => {
                match &e {
                    HardwareError::FrameRateRejected { .. } => self.metrics.record_rejected_write(),
                    HardwareError::RemoteClock(_) => self.metrics.record_remote_clock_failure(),
                    _ => {}
                }
                return Err(e.into());
            }
        };

        match self
            .metrics
            .record_update(&update, runtime.start_interval, primed)
        {
            Some(LockEvent::Acquired) => info!(
                frame = self.metrics.frames(),
                error_us = update.stability.stabilized_error_us,
                stability_us = update.stability.stability_us,
                "Flash PLL locked"
            ),
            Some(LockEvent::Lost) => warn!(
                frame = self.metrics.frames(),
                error_us = update.stability.stabilized_error_us,
                stability_us = update.stability.stability_us,
                "Flash PLL lost lock"
            ),
            None => {}
        }

        Ok(update)
    }

    /// Silence the strobe and hand the capture device back at the locked rate.
    pub fn stop<S>(&mut self, sink: &mut S) -> Result<(), PllError>
    where
        S: CaptureParameterSink + ?Sized,
    {
        self.check_initialized()?;
        let fps_freq = match (self.state, self.session.as_ref()) {
            (PllState::Active, Some(session)) => session.calibration.runtime.fps_freq,
            (state, _) => return Err(PllError::invalid_state("stop", state)),
        };

        // A rejected rate leaves the session running with the strobe still on.
        sink.set_frame_rate(fps_freq)?;

        self.session = None;
        self.state = PllState::Stopped;
        info!(frame_rate_hz = fps_freq, "Flash PLL stopped");
        self.hardware.write_output(false)?;
        Ok(())
    }

    /// Pulse the hardware reset line.
    pub fn reset_line(&mut self) -> Result<(), PllError> {
        self.check_initialized()?;
        self.pulse_reset()?;
        Ok(())
    }

    fn pulse_reset(&mut self) -> Result<(), HardwareError> {
        self.hardware.assert_reset()?;
        self.clock.spin_micros(RESET_SETTLE_US);
        self.hardware.release_reset()
    }

    fn check_initialized(&self) -> Result<(), PllError> {
        match &self.init_error {
            Some(e) => Err(PllError::Initialization(e.clone())),
            None => Ok(()),
        }
    }
}

impl<H: PulseHardware, C: LocalClock> Drop for FlashPll<H, C> {
    fn drop(&mut self) {
        if self.init_error.is_some() {
            return;
        }
        if let Err(e) = self.hardware.write_output(false) {
            warn!(error = %e, "Failed to silence pulse output");
        }
        if let Err(e) = self.pulse_reset() {
            warn!(error = %e, "Failed to reset pulse line");
        }
    }
}

impl<H: PulseHardware, C: LocalClock> fmt::Debug for FlashPll<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashPll")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("init_error", &self.init_error)
            .field("runtime", &self.runtime())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CLOCK_START_LATENCY_US;
    use crate::sim::{ManualClock, SimulatedCamera, SimulatedPulseOutput};

    type SimPll = FlashPll<SimulatedPulseOutput<ManualClock>, ManualClock>;

    fn enabled() -> PllConfig {
        PllConfig {
            enabled: true,
            ..PllConfig::default()
        }
    }

    fn sim_pll(config: PllConfig, clock: &ManualClock) -> SimPll {
        let output = SimulatedPulseOutput::new(clock.clone(), CLOCK_START_LATENCY_US);
        FlashPll::with_clock(config, output, clock.clone(), true)
    }

    /// Drive `frames` frames at the camera's current rate; returns the last update.
    fn run_frames(
        pll: &mut SimPll,
        clock: &ManualClock,
        camera: &mut SimulatedCamera<ManualClock>,
        first_frame_us: f64,
        frames: usize,
    ) -> (f64, FrameUpdate) {
        let mut next_frame = first_frame_us;
        let mut last = None;
        for _ in 0..frames {
            clock.set(next_frame as u64);
            let frame = camera.capture_frame();
            last = Some(pll.update(camera, frame).unwrap());
            next_frame += camera.frame_interval_us();
        }
        (next_frame, last.unwrap())
    }

    #[test]
    fn test_construction_resets_line() {
        let clock = ManualClock::new(0);
        let pll = sim_pll(enabled(), &clock);
        assert_eq!(pll.state(), PllState::Uninitialized);
        assert_eq!(pll.hardware().resets(), 1);
        assert!(pll.hardware().registers().mark_space);
        assert_eq!(clock.now_micros(), RESET_SETTLE_US);
    }

    #[test]
    fn test_missing_privilege_is_permanent() {
        let clock = ManualClock::new(0);
        let output = SimulatedPulseOutput::new(clock.clone(), CLOCK_START_LATENCY_US);
        let mut pll = FlashPll::with_clock(enabled(), output, clock.clone(), false);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);

        assert_eq!(pll.initialization_error(), Some(&InitError::PrivilegeRequired));
        assert_eq!(pll.hardware().resets(), 0);

        for _ in 0..2 {
            assert!(matches!(
                pll.start(30.0),
                Err(PllError::Initialization(InitError::PrivilegeRequired))
            ));
        }
        let frame = camera.capture_frame();
        assert!(matches!(
            pll.update(&mut camera, frame),
            Err(PllError::Initialization(_))
        ));
        assert!(matches!(pll.stop(&mut camera), Err(PllError::Initialization(_))));
        assert!(matches!(pll.reset_line(), Err(PllError::Initialization(_))));
        assert_eq!(pll.hardware().clock_starts(), 0);
    }

    #[test]
    fn test_hardware_setup_failure_is_recorded() {
        let clock = ManualClock::new(0);
        let mut output = SimulatedPulseOutput::new(clock.clone(), CLOCK_START_LATENCY_US);
        output.fail_on("assert_reset");
        let mut pll = FlashPll::with_clock(enabled(), output, clock.clone(), true);

        assert!(matches!(
            pll.initialization_error(),
            Some(InitError::HardwareSetup(_))
        ));
        assert!(matches!(pll.start(30.0), Err(PllError::Initialization(_))));
    }

    #[test]
    fn test_disabled_start_is_noop() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(PllConfig::default(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);

        pll.start(30.0).unwrap();
        assert_eq!(pll.state(), PllState::Uninitialized);
        assert_eq!(pll.hardware().clock_starts(), 0);

        let frame = camera.capture_frame();
        assert!(matches!(
            pll.update(&mut camera, frame),
            Err(PllError::InvalidState {
                operation: "update",
                state: PllState::Uninitialized
            })
        ));
    }

    #[test]
    fn test_start_calibrates_and_activates() {
        let clock = ManualClock::new(5_000);
        let mut pll = sim_pll(enabled(), &clock);

        pll.start(30.0).unwrap();
        assert_eq!(pll.state(), PllState::Active);

        // Construction reset, then start reset, then the divider write.
        let runtime = *pll.runtime().unwrap();
        assert_eq!(runtime.start_time, 5_000 + 2 * RESET_SETTLE_US + CLOCK_START_LATENCY_US);
        assert_eq!(runtime.start_interval, 0);
        assert_eq!(runtime.fps_freq, 30.0);
        assert_eq!(pll.hardware().registers().range, 320_000);
        assert_eq!(pll.hardware().resets(), 2);
    }

    #[test]
    fn test_start_while_active_rejected() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        pll.start(30.0).unwrap();

        let err = pll.start(30.0).unwrap_err();
        assert!(matches!(
            err,
            PllError::InvalidState {
                operation: "start",
                state: PllState::Active
            }
        ));
        assert_eq!(err.to_string(), "Cannot start while PLL is active");
        assert_eq!(pll.hardware().clock_starts(), 1);
    }

    #[test]
    fn test_stop_requires_active() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);
        assert!(matches!(
            pll.stop(&mut camera),
            Err(PllError::InvalidState { operation: "stop", .. })
        ));
    }

    #[test]
    fn test_calibration_failure_restores_state() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        let err = pll.start(20_000_000.0).unwrap_err();
        assert!(matches!(
            err,
            PllError::Hardware(HardwareError::UnsupportedFrequency { .. })
        ));
        assert_eq!(pll.state(), PllState::Uninitialized);

        pll.start(30.0).unwrap();
        assert_eq!(pll.state(), PllState::Active);
    }

    #[test]
    fn test_configured_calibration_attempts_are_honoured() {
        let clock = ManualClock::new(0);
        let config = PllConfig {
            calibration_attempts: Some(3),
            ..enabled()
        };
        let mut pll = sim_pll(config, &clock);
        pll.hardware_mut().queue_extra_latency([500; 3]);

        assert!(matches!(
            pll.start(30.0),
            Err(PllError::Hardware(HardwareError::Pulse {
                operation: "calibrate",
                ..
            }))
        ));
        assert_eq!(pll.state(), PllState::Uninitialized);
        assert_eq!(pll.hardware().clock_starts(), 3);

        // The jitter has passed; the next start succeeds first time.
        pll.start(30.0).unwrap();
        assert_eq!(pll.hardware().clock_starts(), 4);
    }

    #[test]
    fn test_locks_to_offset_camera() {
        let clock = ManualClock::new(1_000_000);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 750_000);

        pll.start(camera.frame_rate()).unwrap();
        let runtime = *pll.runtime().unwrap();

        // First frame lands a third of a period away from the pulse train.
        let first = runtime.start_time as f64 + 11_000.0;
        let (_, last) = run_frames(&mut pll, &clock, &mut camera, first, 600);

        assert!(
            last.stability.stabilized_error_us.abs() < 100.0,
            "phase error did not converge: {:?}",
            last.stability
        );
        let status = pll.lock_status();
        assert!(status.locked, "not locked: {:?}", status);
        assert_eq!(status.frames, 600);
        assert!(status.rate_writes > 0);
        assert!((camera.frame_rate() - 30.0).abs() < 0.05);
        assert_eq!(last.offset.offset, 750_000);
    }

    #[test]
    fn test_locks_with_drifting_remote_clock() {
        let clock = ManualClock::new(2_000_000);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, -40_000).with_drift_ppm(20.0);

        pll.start(30.0).unwrap();
        let first = pll.runtime().unwrap().start_time as f64 + 20_000.0;
        let (_, last) = run_frames(&mut pll, &clock, &mut camera, first, 900);

        assert!(
            last.stability.stabilized_error_us.abs() < 100.0,
            "phase error did not converge: {:?}",
            last.stability
        );
    }

    #[test]
    fn test_stop_restores_locked_rate() {
        let clock = ManualClock::new(100_000);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);

        pll.start(30.0).unwrap();
        let fps_freq = pll.runtime().unwrap().fps_freq;
        let first = pll.runtime().unwrap().start_time as f64 + 9_000.0;
        run_frames(&mut pll, &clock, &mut camera, first, 10);
        assert_ne!(camera.frame_rate(), fps_freq);

        pll.stop(&mut camera).unwrap();
        assert_eq!(pll.state(), PllState::Stopped);
        assert_eq!(camera.frame_rate(), fps_freq);
        assert_eq!(pll.hardware().registers().output_level, Some(false));
        assert!(pll.runtime().is_none());

        let frame = camera.capture_frame();
        assert!(matches!(
            pll.update(&mut camera, frame),
            Err(PllError::InvalidState {
                state: PllState::Stopped,
                ..
            })
        ));

        // A stopped PLL can be started again.
        pll.start(30.0).unwrap();
        assert_eq!(pll.state(), PllState::Active);
        assert_eq!(pll.lock_status().frames, 0);
    }

    #[test]
    fn test_failed_stop_keeps_session_running() {
        let clock = ManualClock::new(100_000);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);
        pll.start(30.0).unwrap();

        camera.fail_writes(true);
        assert!(matches!(
            pll.stop(&mut camera),
            Err(PllError::Hardware(HardwareError::FrameRateRejected { .. }))
        ));
        assert_eq!(pll.state(), PllState::Active);
        assert!(pll.runtime().is_some());
        assert_ne!(pll.hardware().registers().output_level, Some(false));

        camera.fail_writes(false);
        pll.stop(&mut camera).unwrap();
        assert_eq!(pll.state(), PllState::Stopped);
        assert_eq!(pll.hardware().registers().output_level, Some(false));
    }

    #[test]
    fn test_unsilenced_output_still_stops() {
        let clock = ManualClock::new(100_000);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);
        pll.start(30.0).unwrap();

        pll.hardware_mut().fail_on("write_output");
        assert!(matches!(
            pll.stop(&mut camera),
            Err(PllError::Hardware(HardwareError::Pulse { .. }))
        ));
        assert_eq!(pll.state(), PllState::Stopped);
        assert_eq!(camera.frame_rate(), 30.0);
    }

    #[test]
    fn test_rejected_rate_write_propagates() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);
        pll.start(30.0).unwrap();

        camera.fail_writes(true);
        clock.set(pll.runtime().unwrap().start_time + 10_000);
        let frame = camera.capture_frame();
        assert!(matches!(
            pll.update(&mut camera, frame),
            Err(PllError::Hardware(HardwareError::FrameRateRejected { .. }))
        ));
        assert_eq!(pll.state(), PllState::Active);
        assert_eq!(pll.lock_status().rejected_writes, 1);
        assert_eq!(pll.controller().unwrap().tracker().samples(), 1);
    }

    #[test]
    fn test_remote_clock_failure_is_not_a_rejected_write() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        let mut camera = SimulatedCamera::new(clock.clone(), 30.0, 0);
        pll.start(30.0).unwrap();

        camera.fail_queries(true);
        clock.set(pll.runtime().unwrap().start_time + 10_000);
        let frame = camera.capture_frame();
        assert!(matches!(
            pll.update(&mut camera, frame),
            Err(PllError::Hardware(HardwareError::RemoteClock(_)))
        ));

        let status = pll.lock_status();
        assert_eq!(status.rejected_writes, 0);
        assert_eq!(status.remote_clock_failures, 1);
        assert_eq!(status.frames, 1);
        assert!(camera.rate_history().is_empty());
    }

    #[test]
    fn test_reset_pulses_line() {
        let clock = ManualClock::new(0);
        let mut pll = sim_pll(enabled(), &clock);
        pll.reset_line().unwrap();
        assert_eq!(pll.hardware().resets(), 2);
        assert!(!pll.hardware().registers().reset_asserted);
    }
}
