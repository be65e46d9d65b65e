//! Configuration module for persistent settings.
//!
//! This module handles loading, saving, and validating the PLL and daemon
//! configuration.

use crate::controller::ControllerMode;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Highest frame rate the daemon will drive.
pub const MAX_FRAME_RATE_HZ: f64 = 240.0;

/// Per-instance PLL settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PllConfig {
    pub enabled: bool,
    /// Frames per pulse.
    pub divider: u32,
    /// Shift applied to the phase error, in microseconds.
    pub phase_offset_us: i64,
    pub pulse_width_ms: f64,
    /// Log every update at info level.
    pub verbose: bool,
    pub controller: ControllerMode,
    /// Give up calibrating after this many jittery clock starts. Retries
    /// forever when unset.
    pub calibration_attempts: Option<u32>,
}

impl Default for PllConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            divider: 1,
            phase_offset_us: 0,
            pulse_width_ms: 0.5 / 30.0,
            verbose: false,
            controller: ControllerMode::Proportional,
            calibration_attempts: None,
        }
    }
}

impl PllConfig {
    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.divider == 0 {
            return Err(ConfigError::ValidationError(
                "divider must be at least 1".to_string(),
            ));
        }

        if !self.pulse_width_ms.is_finite() || self.pulse_width_ms < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "pulse_width_ms ({}) must be a non-negative number",
                self.pulse_width_ms
            )));
        }

        if self.calibration_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "calibration_attempts must be at least 1 when set".to_string(),
            ));
        }

        self.controller.validate()
    }
}

/// Parameters of the simulated capture device and pulse output.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// local - remote clock offset, in microseconds.
    pub offset_us: i64,
    /// Remote clock rate error in parts per million.
    pub drift_ppm: f64,
    /// Delay between the divider write and the first pulse.
    pub activation_latency_us: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            offset_us: 0,
            drift_ppm: 20.0,
            activation_latency_us: crate::calibrator::CLOCK_START_LATENCY_US,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub frame_rate_hz: f64,
    pub pll: PllConfig,
    pub simulation: SimulationConfig,
    /// Frames between lock status log lines.
    pub status_interval_frames: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            frame_rate_hz: 30.0,
            pll: PllConfig {
                enabled: true,
                ..PllConfig::default()
            },
            simulation: SimulationConfig::default(),
            status_interval_frames: 100,
        }
    }
}

impl DaemonConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frame_rate_hz.is_finite()
            || self.frame_rate_hz <= 0.0
            || self.frame_rate_hz > MAX_FRAME_RATE_HZ
        {
            return Err(ConfigError::ValidationError(format!(
                "frame_rate_hz ({}) must be in (0, {}]",
                self.frame_rate_hz, MAX_FRAME_RATE_HZ
            )));
        }

        if !self.simulation.drift_ppm.is_finite() || self.simulation.drift_ppm.abs() > 1_000.0 {
            return Err(ConfigError::ValidationError(format!(
                "simulation.drift_ppm ({}) must be within +-1000",
                self.simulation.drift_ppm
            )));
        }

        if self.status_interval_frames == 0 {
            return Err(ConfigError::ValidationError(
                "status_interval_frames must be at least 1".to_string(),
            ));
        }

        self.pll.validate()
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<DaemonConfig>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: DaemonConfig = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            DaemonConfig::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Load configuration from a file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        Self::load_or_default(path)
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.config.read().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire read lock".to_string())
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> DaemonConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| DaemonConfig::default())
    }

    /// Update configuration with validation, then persist it.
    pub fn update(&self, config: DaemonConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let mut current = self.config.write().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire write lock".to_string())
        })?;

        *current = config;

        // Release lock before saving
        drop(current);

        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (~/.config/flash-pll/config.json).
    pub fn default_path() -> PathBuf {
        config_dir().join("config.json")
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("flash-pll"))
        .unwrap_or_else(|| std::env::temp_dir().join("flash-pll"))
}
