//! Simulated collaborators.
//!
//! Used by the daemon's offline mode and by tests. `ManualClock` makes every
//! busy-wait deterministic: spinning advances simulated time instead of
//! burning CPU.

use crate::clock::LocalClock;
use crate::error::HardwareError;
use crate::hardware::{CaptureParameterSink, FrameEvent, PulseHardware, RemoteClockSource};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared, manually advanced microsecond clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_us)),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.set(now_us);
    }

    pub fn advance(&self, micros: u64) {
        self.now.set(self.now.get() + micros);
    }
}

impl LocalClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.get()
    }

    fn spin_micros(&self, micros: u64) {
        self.advance(micros);
    }
}

/// A capture device whose clock runs at a fixed offset (and optional drift)
/// from the local clock.
#[derive(Debug)]
pub struct SimulatedCamera<C: LocalClock> {
    clock: C,
    /// local - remote at local time zero, in microseconds.
    offset_us: i64,
    /// Remote clock rate error in parts per million.
    drift_ppm: f64,
    frame_rate: f64,
    /// Per-query round trip delays; an empty queue means instantaneous.
    query_delays_us: VecDeque<u64>,
    /// Every frame rate committed through `set_frame_rate`.
    rate_history: Vec<f64>,
    fail_writes: bool,
    fail_queries: bool,
}

impl<C: LocalClock> SimulatedCamera<C> {
    pub fn new(clock: C, frame_rate: f64, offset_us: i64) -> Self {
        Self {
            clock,
            offset_us,
            drift_ppm: 0.0,
            frame_rate,
            query_delays_us: VecDeque::new(),
            rate_history: Vec::new(),
            fail_writes: false,
            fail_queries: false,
        }
    }

    pub fn with_drift_ppm(mut self, drift_ppm: f64) -> Self {
        self.drift_ppm = drift_ppm;
        self
    }

    /// Queue round-trip delays for upcoming remote clock queries.
    pub fn queue_query_delays(&mut self, delays: impl IntoIterator<Item = u64>) {
        self.query_delays_us.extend(delays);
    }

    /// Make every subsequent `set_frame_rate` fail.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make every subsequent remote clock query fail.
    pub fn fail_queries(&mut self, fail: bool) {
        self.fail_queries = fail;
    }

    pub fn rate_history(&self) -> &[f64] {
        &self.rate_history
    }

    /// Time between frames at the currently configured rate.
    pub fn frame_interval_us(&self) -> f64 {
        1_000_000.0 / self.frame_rate
    }

    /// Remote-domain time corresponding to a local instant.
    pub fn remote_at(&self, local_us: u64) -> u64 {
        let scaled = local_us as f64 * (1.0 + self.drift_ppm * 1e-6);
        (scaled - self.offset_us as f64).max(0.0) as u64
    }

    /// Timestamp a frame completing now.
    pub fn capture_frame(&self) -> FrameEvent {
        FrameEvent::new(self.remote_at(self.clock.now_micros()))
    }
}

impl<C: LocalClock> RemoteClockSource for SimulatedCamera<C> {
    fn remote_time_micros(&mut self) -> Result<u64, HardwareError> {
        if self.fail_queries {
            return Err(HardwareError::RemoteClock("simulated query failure".to_string()));
        }
        let delay = self.query_delays_us.pop_front().unwrap_or(0);
        self.clock.spin_micros(delay / 2);
        let remote = self.remote_at(self.clock.now_micros());
        self.clock.spin_micros(delay - delay / 2);
        Ok(remote)
    }
}

impl<C: LocalClock> CaptureParameterSink for SimulatedCamera<C> {
    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn set_frame_rate(&mut self, hz: f64) -> Result<(), HardwareError> {
        if self.fail_writes {
            return Err(HardwareError::FrameRateRejected {
                hz,
                reason: "simulated port failure".to_string(),
            });
        }
        self.frame_rate = hz;
        self.rate_history.push(hz);
        Ok(())
    }
}

/// Register state of a simulated PWM block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseRegisters {
    pub clock_divider: u32,
    pub range: u32,
    pub duty: u32,
    pub output_level: Option<bool>,
    pub reset_asserted: bool,
    pub mark_space: bool,
}

/// A PWM block whose clock starts a fixed latency after `set_clock_divider`
/// is called.
#[derive(Debug)]
pub struct SimulatedPulseOutput<C: LocalClock> {
    clock: C,
    activation_latency_us: u64,
    /// Extra latency for upcoming `set_clock_divider` calls, simulating
    /// preemption of the calibrating thread.
    extra_latency_us: VecDeque<u64>,
    registers: PulseRegisters,
    clock_starts: u32,
    resets: u32,
    fail_operation: Option<&'static str>,
}

impl<C: LocalClock> SimulatedPulseOutput<C> {
    pub fn new(clock: C, activation_latency_us: u64) -> Self {
        Self {
            clock,
            activation_latency_us,
            extra_latency_us: VecDeque::new(),
            registers: PulseRegisters::default(),
            clock_starts: 0,
            resets: 0,
            fail_operation: None,
        }
    }

    pub fn queue_extra_latency(&mut self, latencies: impl IntoIterator<Item = u64>) {
        self.extra_latency_us.extend(latencies);
    }

    /// Make the named operation fail from now on.
    pub fn fail_on(&mut self, operation: &'static str) {
        self.fail_operation = Some(operation);
    }

    pub fn registers(&self) -> &PulseRegisters {
        &self.registers
    }

    /// Number of times the pulse clock was (re)started.
    pub fn clock_starts(&self) -> u32 {
        self.clock_starts
    }

    /// Number of completed reset pulses.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn check(&self, operation: &'static str) -> Result<(), HardwareError> {
        if self.fail_operation == Some(operation) {
            return Err(HardwareError::Pulse {
                operation,
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

impl<C: LocalClock> PulseHardware for SimulatedPulseOutput<C> {
    fn configure_output(&mut self) -> Result<(), HardwareError> {
        self.check("configure_output")?;
        self.registers.mark_space = true;
        Ok(())
    }

    fn set_clock_divider(&mut self, divider: u32) -> Result<(), HardwareError> {
        self.check("set_clock_divider")?;
        let extra = self.extra_latency_us.pop_front().unwrap_or(0);
        self.clock.spin_micros(self.activation_latency_us + extra);
        self.registers.clock_divider = divider;
        self.clock_starts += 1;
        Ok(())
    }

    fn set_range(&mut self, range: u32) -> Result<(), HardwareError> {
        self.check("set_range")?;
        self.registers.range = range;
        Ok(())
    }

    fn set_duty_register(&mut self, ticks: u32) -> Result<(), HardwareError> {
        self.check("set_duty_register")?;
        self.registers.duty = ticks;
        self.registers.output_level = None;
        Ok(())
    }

    fn write_output(&mut self, level: bool) -> Result<(), HardwareError> {
        self.check("write_output")?;
        self.registers.output_level = Some(level);
        if !level {
            self.registers.duty = 0;
        }
        Ok(())
    }

    fn assert_reset(&mut self) -> Result<(), HardwareError> {
        self.check("assert_reset")?;
        self.registers.reset_asserted = true;
        Ok(())
    }

    fn release_reset(&mut self) -> Result<(), HardwareError> {
        self.check("release_reset")?;
        if self.registers.reset_asserted {
            self.resets += 1;
        }
        self.registers.reset_asserted = false;
        Ok(())
    }
}
