//! Error types for the flash PLL.
//!
//! Each collaborator boundary gets its own enum; `PllError` is what the
//! lifecycle and controller hand back to callers.

use crate::pll::PllState;
use thiserror::Error;

/// Errors raised by the hardware collaborators (pulse output, capture device).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("Pulse hardware operation '{operation}' failed: {reason}")]
    Pulse {
        operation: &'static str,
        reason: String,
    },

    #[error("Capture device rejected frame rate {hz:.5}Hz: {reason}")]
    FrameRateRejected { hz: f64, reason: String },

    #[error("Remote clock query failed: {0}")]
    RemoteClock(String),

    #[error("Pulse frequency {hz}Hz cannot be produced (range register would be {range})")]
    UnsupportedFrequency { hz: f64, range: f64 },
}

/// Permanent failures detected while constructing a PLL instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Pulse hardware access requires root privileges")]
    PrivilegeRequired,

    #[error("Pulse hardware setup failed: {0}")]
    HardwareSetup(String),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at '{0}'")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Top-level PLL errors.
#[derive(Error, Debug)]
pub enum PllError {
    #[error("PLL incorrectly initialised: {0}")]
    Initialization(#[from] InitError),

    #[error("Cannot {operation} while PLL is {state}")]
    InvalidState {
        operation: &'static str,
        state: PllState,
    },

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PllError {
    pub(crate) fn invalid_state(operation: &'static str, state: PllState) -> Self {
        PllError::InvalidState { operation, state }
    }
}
