//! Configuration system using Figment.
//!
//! This module provides strongly-typed configuration loading for the FTS
//! control application. Configuration is merged from:
//! 1. Built-in defaults
//! 2. A `cryo_fts.toml` file (or any path passed to [`FtsConfig::load_from`])
//! 3. Environment variables (prefixed with `CRYO_FTS_`, nested keys
//!    separated by `__`, e.g. `CRYO_FTS_SCAN__SAMPLE_RATE_HZ=25`)
//!
//! # Example
//! ```no_run
//! use cryo_fts::config::FtsConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FtsConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/cryo_fts.toml";

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Mirror carriage motor settings
    pub motor: MotorConfig,
    /// Position encoder settings
    pub encoder: EncoderConfig,
    /// Sensor (lock-in or frequency source) settings
    pub sensor: SensorConfig,
    /// Scan engine tuning
    pub scan: ScanTuning,
    /// Storage settings
    pub storage: StorageConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "cryo_fts".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Which motor driver to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorKind {
    /// Zaber linear stage over a serial port
    Zaber,
    /// Simulated carriage (no hardware)
    Mock,
}

/// Mirror carriage motor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Driver selection
    pub kind: MotorKind,
    /// Serial port path (e.g. "/dev/ttyUSB0")
    pub port: String,
    /// Length unit used for positions throughout the system
    #[serde(default = "default_length_unit")]
    pub length_unit: String,
    /// Velocity unit used when none is given per scan
    #[serde(default = "default_velocity_unit")]
    pub velocity_unit: String,
    /// Track length simulated by the mock carriage, in mm
    #[serde(default = "default_mock_track_mm")]
    pub mock_track_mm: f64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            kind: MotorKind::Mock,
            port: "/dev/ttyUSB0".to_string(),
            length_unit: default_length_unit(),
            velocity_unit: default_velocity_unit(),
            mock_track_mm: default_mock_track_mm(),
        }
    }
}

/// Which encoder driver to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Quadrature counter box over a serial port
    Serial,
    /// Counts derived from the simulated carriage
    Mock,
}

/// Position encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Driver selection
    pub kind: EncoderKind,
    /// Serial port path
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_encoder_baud")]
    pub baud: u32,
    /// Physical distance represented by one encoder count, in mm
    #[serde(default = "default_resolution_mm")]
    pub resolution_mm: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            kind: EncoderKind::Mock,
            port: "/dev/ttyUSB1".to_string(),
            baud: default_encoder_baud(),
            resolution_mm: default_resolution_mm(),
        }
    }
}

/// Which sensor driver to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKindConfig {
    /// SR865A lock-in amplifier behind a Prologix GPIB-USB adapter
    Lockin,
    /// Toptica laser frequency source over TCP
    Frequency,
    /// Simulated quadrature signal
    MockLockin,
    /// Simulated frequency source
    MockFrequency,
}

/// Sensor configuration. Fields not relevant to the selected kind are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Driver selection
    pub kind: SensorKindConfig,
    /// Serial port of the Prologix GPIB-USB adapter (lock-in)
    pub port: String,
    /// GPIB address of the SR865A (lock-in)
    #[serde(default = "default_gpib_address")]
    pub gpib_address: u8,
    /// Hostname of the Toptica controller (frequency source)
    pub host: String,
    /// TCP port of the Toptica controller (frequency source)
    #[serde(default = "default_toptica_port")]
    pub tcp_port: u16,
    /// Emission frequency to set before a scan, in GHz (frequency source)
    #[serde(default = "default_emission_ghz")]
    pub emission_ghz: f64,
    /// Internal lock-in modulation frequency, in Hz (frequency source)
    #[serde(default = "default_lockin_freq_hz")]
    pub lockin_freq_hz: f64,
    /// Internal lock-in integration time, in ms (frequency source)
    #[serde(default = "default_integration_time_ms")]
    pub integration_time_ms: f64,
    /// Internal lock-in amplifier gain, in V/A (frequency source)
    #[serde(default = "default_amplifier_gain")]
    pub amplifier_gain: f64,
    /// Pacing between sensor polls, in ms (0 = poll as fast as the device)
    #[serde(default = "default_sensor_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKindConfig::MockLockin,
            port: "/dev/ttyUSB2".to_string(),
            gpib_address: default_gpib_address(),
            host: "toptica.local".to_string(),
            tcp_port: default_toptica_port(),
            emission_ghz: default_emission_ghz(),
            lockin_freq_hz: default_lockin_freq_hz(),
            integration_time_ms: default_integration_time_ms(),
            amplifier_gain: default_amplifier_gain(),
            poll_interval_ms: default_sensor_poll_ms(),
        }
    }
}

/// Scan engine tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTuning {
    /// Default tick rate of the orchestrator loop, in Hz
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: f64,
    /// Position change below which a tick counts as stationary, in mm
    #[serde(default = "default_stationary_epsilon_mm")]
    pub stationary_epsilon_mm: f64,
    /// Consecutive stationary ticks before the scan stops
    #[serde(default = "default_stationary_threshold")]
    pub stationary_threshold: u32,
    /// Fraction of the track at which the scan stops
    #[serde(default = "default_end_of_track_fraction")]
    pub end_of_track_fraction: f64,
    /// Consecutive failed device reads before a stream reader gives up
    #[serde(default = "default_reader_failure_threshold")]
    pub reader_failure_threshold: u32,
    /// Seconds to wait for the scan task when cancelling before declaring it
    /// unresponsive
    #[serde(default = "default_stop_grace_s")]
    pub stop_grace_s: f64,
}

impl Default for ScanTuning {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_sample_rate_hz(),
            stationary_epsilon_mm: default_stationary_epsilon_mm(),
            stationary_threshold: default_stationary_threshold(),
            end_of_track_fraction: default_end_of_track_fraction(),
            reader_failure_threshold: default_reader_failure_threshold(),
            stop_grace_s: default_stop_grace_s(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for scan output files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            motor: MotorConfig::default(),
            encoder: EncoderConfig::default(),
            sensor: SensorConfig::default(),
            scan: ScanTuning::default(),
            storage: StorageConfig::default(),
        }
    }
}

// Default value functions
fn default_length_unit() -> String {
    "mm".to_string()
}

fn default_velocity_unit() -> String {
    "mm/s".to_string()
}

fn default_mock_track_mm() -> f64 {
    50.0
}

fn default_encoder_baud() -> u32 {
    9600
}

// One count of the quadrature counter is 0.244140625 um on this instrument.
fn default_resolution_mm() -> f64 {
    0.000244140625
}

fn default_gpib_address() -> u8 {
    8
}

fn default_toptica_port() -> u16 {
    1998
}

fn default_emission_ghz() -> f64 {
    100.0
}

fn default_lockin_freq_hz() -> f64 {
    5000.0
}

fn default_integration_time_ms() -> f64 {
    100.0
}

fn default_amplifier_gain() -> f64 {
    1e6
}

fn default_sensor_poll_ms() -> u64 {
    20
}

fn default_sample_rate_hz() -> f64 {
    10.0
}

fn default_stationary_epsilon_mm() -> f64 {
    0.001
}

fn default_stationary_threshold() -> u32 {
    5
}

fn default_end_of_track_fraction() -> f64 {
    0.98
}

fn default_reader_failure_threshold() -> u32 {
    10
}

fn default_stop_grace_s() -> f64 {
    5.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl FtsConfig {
    /// Load configuration from the default file path and environment.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(FtsConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CRYO_FTS_").split("__"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(self.scan.sample_rate_hz.is_finite() && self.scan.sample_rate_hz > 0.0) {
            return Err(format!(
                "Invalid sample_rate_hz {}; must be a positive number",
                self.scan.sample_rate_hz
            ));
        }

        if !(self.scan.stationary_epsilon_mm.is_finite() && self.scan.stationary_epsilon_mm > 0.0) {
            return Err(format!(
                "Invalid stationary_epsilon_mm {}; must be a positive number",
                self.scan.stationary_epsilon_mm
            ));
        }

        if self.scan.stationary_threshold == 0 {
            return Err("stationary_threshold must be at least 1".to_string());
        }

        if !(self.scan.end_of_track_fraction > 0.0 && self.scan.end_of_track_fraction <= 1.0) {
            return Err(format!(
                "Invalid end_of_track_fraction {}; must be in (0, 1]",
                self.scan.end_of_track_fraction
            ));
        }

        if !(self.encoder.resolution_mm.is_finite() && self.encoder.resolution_mm > 0.0) {
            return Err(format!(
                "Invalid encoder resolution_mm {}; must be a positive number",
                self.encoder.resolution_mm
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_valid() {
        let config = FtsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.sample_rate_hz, 10.0);
        assert_eq!(config.scan.stationary_threshold, 5);
        assert_eq!(config.encoder.resolution_mm, 0.000244140625);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = FtsConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.application.name, "cryo_fts");
        assert_eq!(config.sensor.gpib_address, 8);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cryo_fts.toml");
        std::fs::write(
            &path,
            r#"
            [scan]
            sample_rate_hz = 25.0

            [motor]
            kind = "mock"
            port = "/dev/ttyS9"
            "#,
        )
        .unwrap();

        let config = FtsConfig::load_from(&path).unwrap();
        assert_eq!(config.scan.sample_rate_hz, 25.0);
        assert_eq!(config.motor.port, "/dev/ttyS9");
        // Untouched sections keep their defaults
        assert_eq!(config.scan.stationary_threshold, 5);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        std::env::set_var("CRYO_FTS_SCAN__SAMPLE_RATE_HZ", "50.0");
        let config = FtsConfig::load_from("does/not/exist.toml").unwrap();
        std::env::remove_var("CRYO_FTS_SCAN__SAMPLE_RATE_HZ");
        assert_eq!(config.scan.sample_rate_hz, 50.0);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = FtsConfig::default();
        config.scan.sample_rate_hz = 0.0;
        assert!(config.validate().is_err());

        let mut config = FtsConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = FtsConfig::default();
        config.scan.end_of_track_fraction = 1.5;
        assert!(config.validate().is_err());
    }
}
