//! Software phase-locked loop that aligns a hardware strobe pulse train with
//! the exposures of a capture device running on its own clock.
//!
//! The loop estimates the offset between the two clock domains, calibrates
//! the start time of the pulse generator, and then nudges the capture frame
//! rate every frame so that frame timestamps converge onto pulse edges.

pub mod calibrator;
pub mod clock;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod metrics;
pub mod offset;
pub mod pll;
pub mod ring;
pub mod sim;
pub mod tracker;

pub use calibrator::{HardwareCalibrator, PllRuntimeState, PwmSettings};
pub use clock::{LocalClock, MonotonicClock};
pub use config::{ConfigManager, DaemonConfig, PllConfig};
pub use controller::{ControllerMode, FrameUpdate, PhaseController};
pub use error::{ConfigError, HardwareError, InitError, PllError};
pub use hardware::{CaptureDevice, CaptureParameterSink, FrameEvent, PulseHardware, RemoteClockSource};
pub use offset::{ClockOffset, ClockOffsetEstimator};
pub use pll::{FlashPll, PllState};
pub use tracker::JitterStabilityTracker;
