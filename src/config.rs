//! Configuration loading using Figment
//!
//! Settings are layered, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`--config <path>`, or `mppt.toml` in the working directory if present)
//! 3. Environment variables prefixed with `MPPT_`, nested with `__`
//! 4. Command-line overrides
//!
//! ```text
//! MPPT_RUN__TRACKING_TIME_SECONDS=600
//! MPPT_LIMITS__CURRENT_COMPLIANCE=0.03
//! MPPT_LOGGING__LEVEL=debug
//! ```
//!
//! Validation runs after extraction and before any hardware is contacted.
//!
//! # Example
//!
//! ```no_run
//! use mppt_daq::config::Settings;
//!
//! let settings = Settings::load(Some("mppt.toml".as_ref()), None)?;
//! println!("Tracking for {} s", settings.run.tracking_time_seconds);
//! # Ok::<(), mppt_daq::error::MppError>(())
//! ```

use crate::adapters::gpib_resource;
use crate::error::{AppResult, MppError};
use crate::safety::{ProtectionLimits, DEFAULT_CURRENT_COMPLIANCE, DEFAULT_VOLTAGE_PROTECTION};
use crate::shutter::{DEFAULT_CLOSE_COMMAND, DEFAULT_OPEN_COMMAND};
use crate::sourcemeter::{SweepTiming, DEFAULT_SWEEP_RATE};
use crate::tracker::{TrackerSettings, DEFAULT_VOLTAGE_STEP};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "mppt.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MPPT_";

const GPIB_ADDRESS_PATTERN: &str = r"^[0-9]{1,2}$";

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Per-run user settings
    #[serde(default)]
    pub run: RunConfig,
    /// Requested protection limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Tracker and sweep tunables
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Sourcemeter link settings
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Shutter line settings
    #[serde(default)]
    pub shutter: ShutterConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-run user settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunConfig {
    /// Total tracking time in seconds
    #[serde(default)]
    pub tracking_time_seconds: u64,
    /// Device active area in cm²
    #[serde(default)]
    pub device_area_cm2: f64,
    /// GPIB address of the sourcemeter (one or two digits)
    #[serde(default)]
    pub gpib_address: String,
    /// Drive the shutter
    #[serde(default)]
    pub shutter: bool,
    /// Use simulated instruments
    #[serde(default)]
    pub dummy: bool,
    /// Free-form note attached to the run report
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Requested protection limits, clamped later by the safety envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Voltage protection in V
    #[serde(default = "default_voltage_protection")]
    pub voltage_protection: f64,
    /// Current compliance in A
    #[serde(default = "default_current_compliance")]
    pub current_compliance: f64,
}

/// Tracker and sweep tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Perturbation step in V
    #[serde(default = "default_voltage_step")]
    pub voltage_step: f64,
    /// Per-point source delay in seconds
    #[serde(default = "default_settling_delay")]
    pub settling_delay: f64,
    /// JV sweep rate in V/s
    #[serde(default = "default_sweep_rate")]
    pub sweep_rate: f64,
    /// Open-circuit settling time in seconds
    #[serde(default = "default_voc_hold_time")]
    pub voc_hold_time: f64,
}

/// GPIB link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// GPIB board index
    #[serde(default)]
    pub board: u8,
    /// Open and I/O timeout in milliseconds. Sweep reads get longer when needed
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Line terminator for commands
    #[serde(default = "default_read_termination")]
    pub read_termination: String,
}

/// Shutter digital line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutterConfig {
    /// VISA resource of the DAQ line
    #[serde(default = "default_shutter_resource")]
    pub resource: String,
    /// Command that opens the shutter
    #[serde(default = "default_open_command")]
    pub open_command: String,
    /// Command that closes the shutter
    #[serde(default = "default_close_command")]
    pub close_command: String,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, written in addition to the console
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_voltage_protection() -> f64 {
    DEFAULT_VOLTAGE_PROTECTION
}

fn default_current_compliance() -> f64 {
    DEFAULT_CURRENT_COMPLIANCE
}

fn default_voltage_step() -> f64 {
    DEFAULT_VOLTAGE_STEP
}

fn default_settling_delay() -> f64 {
    0.05
}

fn default_sweep_rate() -> f64 {
    DEFAULT_SWEEP_RATE
}

fn default_voc_hold_time() -> f64 {
    5.0
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_read_termination() -> String {
    "\n".to_string()
}

fn default_shutter_resource() -> String {
    "GPIB0::24::INSTR".to_string()
}

fn default_open_command() -> String {
    DEFAULT_OPEN_COMMAND.to_string()
}

fn default_close_command() -> String {
    DEFAULT_CLOSE_COMMAND.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            voltage_protection: default_voltage_protection(),
            current_compliance: default_current_compliance(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            voltage_step: default_voltage_step(),
            settling_delay: default_settling_delay(),
            sweep_rate: default_sweep_rate(),
            voc_hold_time: default_voc_hold_time(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            board: 0,
            timeout_ms: default_timeout_ms(),
            read_termination: default_read_termination(),
        }
    }
}

impl Default for ShutterConfig {
    fn default() -> Self {
        Self {
            resource: default_shutter_resource(),
            open_command: default_open_command(),
            close_command: default_close_command(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional file, the environment and
    /// `overrides`, then validate.
    ///
    /// An explicitly named file must exist. Without one, `mppt.toml` is read
    /// only if present.
    pub fn load(config_file: Option<&Path>, overrides: Option<Figment>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(MppError::Configuration(format!(
                        "Config file '{}' not found",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        if let Some(overrides) = overrides {
            figment = figment.merge(overrides);
        }

        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks on the merged settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.run.tracking_time_seconds == 0 {
            return Err(MppError::Configuration(
                "tracking_time_seconds must be greater than 0".to_string(),
            ));
        }

        if self.run.device_area_cm2.is_nan() || self.run.device_area_cm2 <= 0.0 {
            return Err(MppError::Configuration(format!(
                "device_area_cm2 must be greater than 0, got {}",
                self.run.device_area_cm2
            )));
        }

        if self.run.gpib_address.is_empty() {
            if !self.run.dummy {
                return Err(MppError::Configuration(
                    "gpib_address is required unless running in dummy mode".to_string(),
                ));
            }
        } else {
            let pattern = Regex::new(GPIB_ADDRESS_PATTERN)
                .map_err(|e| MppError::Configuration(e.to_string()))?;
            if !pattern.is_match(&self.run.gpib_address) {
                return Err(MppError::Configuration(format!(
                    "GPIB address '{}' is invalid. Should be a two digit number, typically between 0 and 30.",
                    self.run.gpib_address
                )));
            }
        }

        let positive = [
            ("voltage_step", self.tracking.voltage_step),
            ("settling_delay", self.tracking.settling_delay),
            ("sweep_rate", self.tracking.sweep_rate),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(MppError::Configuration(format!(
                    "tracking.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if !self.tracking.voc_hold_time.is_finite() || self.tracking.voc_hold_time < 0.0 {
            return Err(MppError::Configuration(format!(
                "tracking.voc_hold_time must not be negative, got {}",
                self.tracking.voc_hold_time
            )));
        }

        if self.run.shutter && !self.run.dummy && self.shutter.resource.is_empty() {
            return Err(MppError::Configuration(
                "shutter.resource cannot be empty when shutter control is enabled".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(MppError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// VISA resource string of the sourcemeter.
    pub fn sourcemeter_resource(&self) -> String {
        gpib_resource(self.instrument.board, &self.run.gpib_address)
    }

    /// Requested limits run through the safety envelope.
    pub fn protection_limits(&self) -> ProtectionLimits {
        ProtectionLimits::with_protection(
            self.limits.voltage_protection,
            self.limits.current_compliance,
        )
    }

    /// Sweep pacing for the sourcemeter backends.
    pub fn sweep_timing(&self) -> SweepTiming {
        SweepTiming {
            settling_delay: Duration::from_secs_f64(self.tracking.settling_delay),
            sweep_rate: self.tracking.sweep_rate,
        }
    }

    /// Tracker tunables for this run.
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            voltage_step: self.tracking.voltage_step,
            voc_hold_time: Duration::from_secs_f64(self.tracking.voc_hold_time),
            tracking_time: Duration::from_secs(self.run.tracking_time_seconds),
        }
    }

    /// Instrument link I/O timeout.
    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.instrument.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> Settings {
        Settings {
            run: RunConfig {
                tracking_time_seconds: 60,
                device_area_cm2: 0.16,
                gpib_address: "20".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn write_toml(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_settings_pass() {
        let settings = valid();
        settings.validate().unwrap();
        assert_eq!(settings.sourcemeter_resource(), "GPIB0::20::INSTR");
        assert_eq!(settings.tracker_settings().tracking_time, Duration::from_secs(60));
        assert_eq!(settings.link_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_bad_gpib_address() {
        for address in ["abc", "123", "2a", " 1"] {
            let mut settings = valid();
            settings.run.gpib_address = address.to_string();
            let err = settings.validate().unwrap_err();
            assert!(err.is_configuration(), "{address}");
            assert!(err.to_string().contains("is invalid"));
        }
    }

    #[test]
    fn rejects_non_positive_run_values() {
        let mut settings = valid();
        settings.run.tracking_time_seconds = 0;
        assert!(settings.validate().unwrap_err().is_configuration());

        let mut settings = valid();
        settings.run.device_area_cm2 = 0.0;
        assert!(settings.validate().unwrap_err().is_configuration());

        let mut settings = valid();
        settings.run.device_area_cm2 = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn dummy_runs_do_not_need_an_address() {
        let mut settings = valid();
        settings.run.gpib_address.clear();
        assert!(settings.validate().is_err());
        settings.run.dummy = true;
        settings.validate().unwrap();
    }

    #[test]
    fn limits_above_ceiling_are_clamped_not_rejected() {
        let mut settings = valid();
        settings.limits.voltage_protection = 10.0;
        settings.validate().unwrap();
        let limits = settings.protection_limits();
        assert_eq!(limits.voltage_protection(), limits.absolute_max_voltage());
    }

    #[test]
    #[serial]
    fn file_then_env_then_overrides() {
        let file = write_toml(
            r#"
            [run]
            tracking_time_seconds = 30
            device_area_cm2 = 0.5
            gpib_address = "5"

            [tracking]
            voltage_step = 0.02
            "#,
        );
        std::env::set_var("MPPT_RUN__TRACKING_TIME_SECONDS", "45");
        let overrides = Figment::new().merge(Serialized::default("run.gpib_address", "7"));

        let loaded = Settings::load(Some(file.path()), Some(overrides));
        std::env::remove_var("MPPT_RUN__TRACKING_TIME_SECONDS");
        let settings = loaded.unwrap();

        assert_eq!(settings.run.tracking_time_seconds, 45);
        assert_eq!(settings.run.device_area_cm2, 0.5);
        assert_eq!(settings.run.gpib_address, "7");
        assert_eq!(settings.tracking.voltage_step, 0.02);
        assert_eq!(settings.tracking.sweep_rate, DEFAULT_SWEEP_RATE);
    }

    #[test]
    #[serial]
    fn missing_explicit_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/mppt.toml")), None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    #[serial]
    fn invalid_toml_values_are_reported() {
        let file = write_toml(
            r#"
            [run]
            tracking_time_seconds = "soon"
            "#,
        );
        let err = Settings::load(Some(file.path()), None).unwrap_err();
        assert!(err.is_configuration());
    }
}
