//! Per-frame phase controller.
//!
//! Every completed frame is mapped into the local clock domain, compared with
//! the nearest pulse edge, and turned into a new capture frame rate. The
//! camera's frame rate is the actuator: speeding it up pulls the next
//! exposure earlier relative to the fixed pulse train.

use crate::calibrator::PllRuntimeState;
use crate::clock::LocalClock;
use crate::config::PllConfig;
use crate::diagnostics::UpdateLine;
use crate::error::{ConfigError, HardwareError};
use crate::hardware::{CaptureDevice, FrameEvent};
use crate::offset::{ClockOffset, ClockOffsetEstimator, EstimateQuality};
use crate::tracker::{JitterStabilityTracker, StabilitySnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Frame rates are committed as `num / FPS_DENOMINATOR`.
pub const FPS_DENOMINATOR: u32 = 256;

/// `update_rate = fps_freq / UPDATE_RATE_DIVISOR`. With the error bounded to
/// half a period this limits each correction to +-12.5% of the locked rate.
pub const UPDATE_RATE_DIVISOR: f64 = 4.0;

/// Largest magnitude of a normalized phase error.
pub const MAX_ERROR_FRACTION: f64 = 0.5;

/// Gains for the PID update law. Errors are fractions of a period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Bound on the accumulated integral term.
    pub integral_limit: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            integral_limit: 4.0,
        }
    }
}

/// Frequencies stepped through in step-response mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepResponsePlan {
    pub frequencies: Vec<f64>,
    pub frames_per_step: u32,
}

impl Default for StepResponsePlan {
    fn default() -> Self {
        Self {
            frequencies: vec![25.0, 30.0],
            frames_per_step: 300,
        }
    }
}

/// Update law selected at construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControllerMode {
    /// `fps_freq + fps_freq / 4 * error`.
    #[default]
    Proportional,
    Pid(PidGains),
    /// Open-loop frequency steps for characterizing the loop offline.
    StepResponse(StepResponsePlan),
}

impl ControllerMode {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerMode::Proportional => "proportional",
            ControllerMode::Pid(_) => "pid",
            ControllerMode::StepResponse(_) => "step_response",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ControllerMode::Proportional => Ok(()),
            ControllerMode::Pid(gains) => {
                let all_finite = [gains.kp, gains.ki, gains.kd, gains.integral_limit]
                    .iter()
                    .all(|g| g.is_finite());
                if !all_finite {
                    return Err(ConfigError::ValidationError(
                        "PID gains must be finite".to_string(),
                    ));
                }
                if gains.integral_limit < 0.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "PID integral_limit ({}) must not be negative",
                        gains.integral_limit
                    )));
                }
                Ok(())
            }
            ControllerMode::StepResponse(plan) => {
                if plan.frequencies.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "step response needs at least one frequency".to_string(),
                    ));
                }
                if let Some(bad) = plan
                    .frequencies
                    .iter()
                    .find(|f| !f.is_finite() || **f <= 0.0)
                {
                    return Err(ConfigError::ValidationError(format!(
                        "step response frequency ({}) must be positive",
                        bad
                    )));
                }
                if plan.frames_per_step == 0 {
                    return Err(ConfigError::ValidationError(
                        "step response frames_per_step must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Phase of one frame relative to the pulse train.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseError {
    /// Frame timestamp in the local clock domain.
    pub frame_local_us: i64,
    /// Pulses elapsed since calibration start.
    pub pulse_index: i64,
    pub last_pulse_us: f64,
    /// Pulse spacing as seen by frames: `period / divider`.
    pub period_per_frame_us: f64,
    /// Folded error, in `(-period/2, period/2]`.
    pub diff_us: f64,
    /// `diff_us / period_per_frame_us`, in `(-0.5, 0.5]`.
    pub fraction: f64,
}

/// Fold an error into `(-period/2, period/2]`.
///
/// Positive errors beyond half a period mean the frame belongs to the next
/// pulse, which has not fired yet.
pub fn fold_phase_error(diff_us: f64, period_us: f64) -> f64 {
    let wrapped = diff_us.rem_euclid(period_us);
    if wrapped * 2.0 > period_us {
        wrapped - period_us
    } else {
        wrapped
    }
}

/// Locate a local-domain frame timestamp on the pulse train.
pub fn measure_phase(
    frame_local_us: i64,
    runtime: &PllRuntimeState,
    divider: u32,
    phase_offset_us: i64,
) -> PhaseError {
    let period = runtime.period_per_frame(divider);
    let since_start = frame_local_us as f64 - runtime.start_time as f64;
    let pulse_index = (since_start / period).floor();
    let last_pulse_us = runtime.start_time as f64 + pulse_index * period;

    let raw = frame_local_us as f64 - last_pulse_us + phase_offset_us as f64;
    let diff_us = fold_phase_error(raw, period);

    PhaseError {
        frame_local_us,
        pulse_index: pulse_index as i64,
        last_pulse_us,
        period_per_frame_us: period,
        diff_us,
        fraction: diff_us / period,
    }
}

/// Proportional update around the locked frequency.
///
/// Always computed from `fps_freq`, never from the previous output.
pub fn proportional_target(fps_freq: f64, error_fraction: f64) -> f64 {
    let update_rate = fps_freq / UPDATE_RATE_DIVISOR;
    fps_freq + update_rate * error_fraction
}

/// Fixed-point numerator of a frame rate (truncating).
pub fn quantize_frequency(hz: f64) -> u64 {
    (hz * FPS_DENOMINATOR as f64) as u64
}

pub fn dequantize_frequency(num: u64) -> f64 {
    num as f64 / FPS_DENOMINATOR as f64
}

#[derive(Debug, Clone, Default)]
struct PidState {
    gains: PidGains,
    integral: f64,
}

impl PidState {
    /// Controller output as a clamped error fraction.
    fn next(&mut self, error: f64, derivative: f64) -> f64 {
        let limit = self.gains.integral_limit;
        self.integral = (self.integral + error).clamp(-limit, limit);

        let output =
            self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        output.clamp(-MAX_ERROR_FRACTION, MAX_ERROR_FRACTION)
    }
}

#[derive(Debug, Clone)]
struct StepState {
    plan: StepResponsePlan,
    frames: u32,
    index: usize,
}

impl StepState {
    fn next_frequency(&mut self) -> f64 {
        self.frames += 1;
        if self.frames > self.plan.frames_per_step {
            self.frames = 1;
            self.index = (self.index + 1) % self.plan.frequencies.len();
            info!(
                step = self.index,
                frequency_hz = self.plan.frequencies[self.index],
                "Step response: switching frequency"
            );
        }
        self.plan.frequencies[self.index]
    }
}

#[derive(Debug, Clone)]
enum ControlLaw {
    Proportional,
    Pid(PidState),
    StepResponse(StepState),
}

impl From<&ControllerMode> for ControlLaw {
    fn from(mode: &ControllerMode) -> Self {
        match mode {
            ControllerMode::Proportional => ControlLaw::Proportional,
            ControllerMode::Pid(gains) => ControlLaw::Pid(PidState {
                gains: *gains,
                integral: 0.0,
            }),
            ControllerMode::StepResponse(plan) => ControlLaw::StepResponse(StepState {
                plan: plan.clone(),
                frames: 0,
                index: 0,
            }),
        }
    }
}

/// Outcome of one controller update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameUpdate {
    pub phase: PhaseError,
    pub offset: ClockOffset,
    pub offset_quality: EstimateQuality,
    /// Frequency requested by the update law.
    pub target_hz: f64,
    /// Frame rate the device runs at after this update.
    pub frame_rate_hz: f64,
    /// False when the change was below quantization resolution.
    pub written: bool,
    pub stability: StabilitySnapshot,
}

/// Phase controller for one lock session.
#[derive(Debug, Clone)]
pub struct PhaseController {
    law: ControlLaw,
    mode: &'static str,
    estimator: ClockOffsetEstimator,
    tracker: JitterStabilityTracker,
    divider: u32,
    phase_offset_us: i64,
    verbose: bool,
}

impl PhaseController {
    pub fn new(config: &PllConfig) -> Self {
        Self {
            law: ControlLaw::from(&config.controller),
            mode: config.controller.name(),
            estimator: ClockOffsetEstimator::new(),
            tracker: JitterStabilityTracker::new(),
            divider: config.divider.max(1),
            phase_offset_us: config.phase_offset_us,
            verbose: config.verbose,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn tracker(&self) -> &JitterStabilityTracker {
        &self.tracker
    }

    pub fn estimator(&self) -> &ClockOffsetEstimator {
        &self.estimator
    }

    /// Process one completed frame.
    ///
    /// The phase error is recorded in the tracker on every call, whether or
    /// not a new frame rate is written. A rejected frame-rate write is
    /// returned as-is.
    pub fn update<C, D>(
        &mut self,
        runtime: &PllRuntimeState,
        frame: FrameEvent,
        clock: &C,
        device: &mut D,
    ) -> Result<FrameUpdate, HardwareError>
    where
        C: LocalClock + ?Sized,
        D: CaptureDevice + ?Sized,
    {
        let offset = self.estimator.estimate(clock, device)?;
        let offset_quality = self
            .estimator
            .last_quality()
            .unwrap_or(EstimateQuality::Degraded);
        let frame_local = offset.to_local(frame.remote_timestamp_us);
        let phase = measure_phase(frame_local, runtime, self.divider, self.phase_offset_us);

        let stability = self.tracker.record(phase.diff_us);
        let derivative = self.tracker.derivative() / phase.period_per_frame_us;

        let target_hz = match &mut self.law {
            ControlLaw::Proportional => proportional_target(runtime.fps_freq, phase.fraction),
            ControlLaw::Pid(pid) => {
                let output = pid.next(phase.fraction, derivative);
                proportional_target(runtime.fps_freq, output)
            }
            ControlLaw::StepResponse(steps) => steps.next_frequency(),
        };

        let current_hz = device.frame_rate();
        let target_num = quantize_frequency(target_hz);
        let written = target_num != quantize_frequency(current_hz);

        let frame_rate_hz = if written {
            let committed = dequantize_frequency(target_num);
            device.set_frame_rate(committed)?;
            committed
        } else {
            current_hz
        };

        let update = FrameUpdate {
            phase,
            offset,
            offset_quality,
            target_hz,
            frame_rate_hz,
            written,
            stability,
        };

        let line = UpdateLine::new(&update, runtime.start_interval);
        if self.verbose {
            info!(
                diff_us = phase.diff_us,
                fps = frame_rate_hz,
                offset_interval_us = offset.accuracy_interval,
                written,
                "{}",
                line
            );
        } else {
            debug!("{}", line);
        }

        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ManualClock, SimulatedCamera};
    use proptest::prelude::*;

    fn runtime_1khz() -> PllRuntimeState {
        PllRuntimeState {
            period_us: 1_000.0,
            fps_freq: 1_000.0,
            start_time: 0,
            start_interval: 0,
        }
    }

    /// Camera whose remote clock equals the local clock, so offset is zero.
    fn aligned_camera(frame_rate: f64) -> (ManualClock, SimulatedCamera<ManualClock>) {
        let clock = ManualClock::new(50_000);
        let camera = SimulatedCamera::new(clock.clone(), frame_rate, 0);
        (clock, camera)
    }

    #[test]
    fn test_scenario_half_period_boundary_is_not_folded() {
        let phase = measure_phase(1_500, &runtime_1khz(), 1, 0);
        assert_eq!(phase.pulse_index, 1);
        assert_eq!(phase.last_pulse_us, 1_000.0);
        assert_eq!(phase.diff_us, 500.0);
        assert_eq!(phase.fraction, 0.5);
        assert_eq!(proportional_target(1_000.0, phase.fraction), 1_125.0);
    }

    #[test]
    fn test_scenario_late_frame_folds_negative() {
        let phase = measure_phase(1_600, &runtime_1khz(), 1, 0);
        assert_eq!(phase.pulse_index, 1);
        assert_eq!(phase.diff_us, -400.0);
        assert!((phase.fraction + 0.4).abs() < 1e-12);
        let target = proportional_target(1_000.0, phase.fraction);
        assert!((target - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_divider_shortens_period_per_frame() {
        let runtime = PllRuntimeState {
            period_us: 2_000.0,
            fps_freq: 1_000.0,
            start_time: 0,
            start_interval: 0,
        };
        let phase = measure_phase(2_250, &runtime, 2, 0);
        assert_eq!(phase.period_per_frame_us, 1_000.0);
        assert_eq!(phase.pulse_index, 2);
        assert_eq!(phase.diff_us, 250.0);
    }

    #[test]
    fn test_phase_offset_shifts_error() {
        let phase = measure_phase(1_100, &runtime_1khz(), 1, 250);
        assert_eq!(phase.diff_us, 350.0);
        // An offset beyond a full period still lands inside the window.
        let phase = measure_phase(1_100, &runtime_1khz(), 1, 2_250);
        assert_eq!(phase.diff_us, 350.0);
    }

    #[test]
    fn test_frame_before_start_time() {
        let runtime = PllRuntimeState {
            start_time: 10_000,
            ..runtime_1khz()
        };
        let phase = measure_phase(9_700, &runtime, 1, 0);
        assert_eq!(phase.pulse_index, -1);
        assert_eq!(phase.diff_us, -300.0);
    }

    #[test]
    fn test_quantization_truncates_to_1_256_hz() {
        assert_eq!(quantize_frequency(30.0), 7_680);
        assert_eq!(quantize_frequency(30.0039), 7_680);
        assert_eq!(quantize_frequency(30.004), 7_681);
        assert_eq!(dequantize_frequency(7_681), 30.00390625);
    }

    #[test]
    fn test_update_writes_quantized_rate() {
        let (clock, mut camera) = aligned_camera(1_000.0);
        let mut controller = PhaseController::new(&PllConfig::default());

        clock.set(1_500);
        let frame = camera.capture_frame();
        let update = controller
            .update(&runtime_1khz(), frame, &clock, &mut camera)
            .unwrap();

        assert!(update.written);
        assert_eq!(update.target_hz, 1_125.0);
        assert_eq!(update.frame_rate_hz, 1_125.0);
        assert_eq!(camera.rate_history(), &[1_125.0]);
    }

    #[test]
    fn test_sub_resolution_change_is_suppressed_but_recorded() {
        let runtime = PllRuntimeState {
            period_us: 1_000_000.0 / 30.0,
            fps_freq: 30.0,
            start_time: 0,
            start_interval: 0,
        };
        let (clock, mut camera) = aligned_camera(30.0);
        let mut controller = PhaseController::new(&PllConfig::default());

        // One pulse period plus 1us: the correction is ~0.0002Hz.
        clock.set(33_334);
        let frame = camera.capture_frame();
        let update = controller
            .update(&runtime, frame, &clock, &mut camera)
            .unwrap();

        assert!(!update.written);
        assert_eq!(update.frame_rate_hz, 30.0);
        assert!(camera.rate_history().is_empty());
        assert_eq!(controller.tracker().samples(), 1);
        assert!(update.phase.diff_us > 0.0 && update.phase.diff_us < 1.0);
    }

    #[test]
    fn test_rejected_write_propagates_after_recording() {
        let (clock, mut camera) = aligned_camera(1_000.0);
        camera.fail_writes(true);
        let mut controller = PhaseController::new(&PllConfig::default());

        clock.set(1_300);
        let frame = camera.capture_frame();
        let result = controller.update(&runtime_1khz(), frame, &clock, &mut camera);

        assert!(matches!(result, Err(HardwareError::FrameRateRejected { .. })));
        assert_eq!(controller.tracker().samples(), 1);
    }

    /// Frames drifting 10us later every pulse, giving a steady ramp in phase.
    fn ramp_frame_times(frames: u64) -> impl Iterator<Item = (u64, f64)> {
        (1..=frames).map(|k| (k * 1_000 + 10 * k, 10.0 * k as f64))
    }

    #[test]
    fn test_pid_derivative_term_follows_tracker() {
        let gains = PidGains {
            kd: 2.0,
            ..PidGains::default()
        };
        let mut config = PllConfig::default();
        config.controller = ControllerMode::Pid(gains);

        let (clock, mut camera) = aligned_camera(1_000.0);
        let mut controller = PhaseController::new(&config);
        let mut shadow = JitterStabilityTracker::new();
        let runtime = runtime_1khz();

        let mut last_derivative_hz = 0.0;
        for (t, diff) in ramp_frame_times(8) {
            clock.set(t);
            let update = controller
                .update(&runtime, camera.capture_frame(), &clock, &mut camera)
                .unwrap();
            assert_eq!(update.phase.diff_us, diff);

            shadow.record(diff);
            let derivative = shadow.derivative() / runtime.period_us;
            let proportional = proportional_target(runtime.fps_freq, update.phase.fraction);
            last_derivative_hz = gains.kd * derivative * runtime.fps_freq / UPDATE_RATE_DIVISOR;
            assert!(
                (update.target_hz - proportional - last_derivative_hz).abs() < 1e-9,
                "target {} proportional {} derivative {}",
                update.target_hz,
                proportional,
                last_derivative_hz
            );
        }
        // A rising error pushes the rate above the pure proportional law.
        assert!(last_derivative_hz > 0.0);
    }

    #[test]
    fn test_pid_integral_term_accumulates_through_update() {
        let gains = PidGains {
            ki: 0.5,
            ..PidGains::default()
        };
        let mut config = PllConfig::default();
        config.controller = ControllerMode::Pid(gains);

        let (clock, mut camera) = aligned_camera(1_000.0);
        let mut controller = PhaseController::new(&config);
        let runtime = runtime_1khz();

        let mut integral = 0.0;
        for (t, _) in ramp_frame_times(6) {
            clock.set(t);
            let update = controller
                .update(&runtime, camera.capture_frame(), &clock, &mut camera)
                .unwrap();

            integral += update.phase.fraction;
            let output = update.phase.fraction + gains.ki * integral;
            let expected = proportional_target(runtime.fps_freq, output);
            assert!((update.target_hz - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_unit_pid_matches_proportional() {
        let mut pid_config = PllConfig::default();
        pid_config.controller = ControllerMode::Pid(PidGains::default());

        let (clock_p, mut camera_p) = aligned_camera(1_000.0);
        let (clock_i, mut camera_i) = aligned_camera(1_000.0);
        let mut proportional = PhaseController::new(&PllConfig::default());
        let mut pid = PhaseController::new(&pid_config);

        for t in [1_100u64, 2_350, 3_420, 4_780, 5_010] {
            clock_p.set(t);
            clock_i.set(t);
            let a = proportional
                .update(&runtime_1khz(), camera_p.capture_frame(), &clock_p, &mut camera_p)
                .unwrap();
            let b = pid
                .update(&runtime_1khz(), camera_i.capture_frame(), &clock_i, &mut camera_i)
                .unwrap();
            assert!((a.target_hz - b.target_hz).abs() < 1e-9);
        }
        assert_eq!(pid.mode(), "pid");
    }

    #[test]
    fn test_pid_output_stays_within_excursion_bound() {
        let mut state = PidState {
            gains: PidGains {
                kp: 5.0,
                ki: 2.0,
                kd: 0.0,
                integral_limit: 10.0,
            },
            integral: 0.0,
        };
        for _ in 0..20 {
            let output = state.next(0.45, 0.0);
            assert!(output <= MAX_ERROR_FRACTION);
        }
        assert!((state.integral - 9.0).abs() < 1e-9);

        for _ in 0..20 {
            state.next(0.45, 0.0);
        }
        assert_eq!(state.integral, 10.0);
    }

    #[test]
    fn test_step_response_cycles_through_plan() {
        let mut config = PllConfig::default();
        config.controller = ControllerMode::StepResponse(StepResponsePlan {
            frequencies: vec![25.0, 30.0],
            frames_per_step: 3,
        });
        let runtime = PllRuntimeState {
            period_us: 1_000_000.0 / 30.0,
            fps_freq: 30.0,
            start_time: 0,
            start_interval: 0,
        };
        let (clock, mut camera) = aligned_camera(30.0);
        let mut controller = PhaseController::new(&config);

        let mut emitted = Vec::new();
        for i in 1..=8u64 {
            clock.set(i * 33_333);
            let update = controller
                .update(&runtime, camera.capture_frame(), &clock, &mut camera)
                .unwrap();
            emitted.push(update.target_hz);
        }
        assert_eq!(
            emitted,
            vec![25.0, 25.0, 25.0, 30.0, 30.0, 30.0, 25.0, 25.0]
        );
        // Only the transitions reach the device.
        assert_eq!(camera.rate_history(), &[25.0, 30.0, 25.0]);
        assert_eq!(controller.tracker().samples(), 8);
    }

    #[test]
    fn test_mode_validation() {
        assert!(ControllerMode::Proportional.validate().is_ok());
        assert!(ControllerMode::StepResponse(StepResponsePlan {
            frequencies: vec![],
            frames_per_step: 10,
        })
        .validate()
        .is_err());
        assert!(ControllerMode::StepResponse(StepResponsePlan {
            frequencies: vec![30.0],
            frames_per_step: 0,
        })
        .validate()
        .is_err());
        assert!(ControllerMode::Pid(PidGains {
            kp: f64::NAN,
            ..PidGains::default()
        })
        .validate()
        .is_err());
    }

    // Property: folded errors always land in (-period/2, period/2].
    proptest! {
        #[test]
        fn prop_fold_stays_in_half_open_window(
            diff in -1.0e7f64..1.0e7,
            period in 1.0f64..1.0e6,
        ) {
            let folded = fold_phase_error(diff, period);
            prop_assert!(folded > -period / 2.0, "{} <= -{}/2", folded, period);
            prop_assert!(folded <= period / 2.0, "{} > {}/2", folded, period);
        }

        #[test]
        fn prop_fold_matches_single_subtraction_within_one_period(
            fraction in 0.0f64..1.0,
            period in 1.0f64..1.0e5,
        ) {
            let diff = fraction * period;
            let expected = if diff * 2.0 > period { diff - period } else { diff };
            prop_assert_eq!(fold_phase_error(diff, period), expected);
        }

        #[test]
        fn prop_proportional_excursion_bounded(
            fps in 1.0f64..120.0,
            fraction in -0.5f64..=0.5,
        ) {
            let target = proportional_target(fps, fraction);
            prop_assert!((target - fps).abs() <= fps * 0.125 + 1e-9);
        }
    }
}
