// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Configuration module

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::acquisition::{CollectionMode, SpectrometerSettings};
use crate::persistence::LensType;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Application version
    pub version: String,

    /// Data directory handed to the persistence collaborator
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Optional hardware present on this unit
    pub capabilities: Capabilities,

    /// Spectrometer defaults and limits
    pub spectrometer: SpectrometerConfig,

    /// Auto-integration tuning
    pub auto_integration: AutoIntegrationConfig,

    /// Queue capacities
    pub channels: ChannelConfig,

    /// Plot scaling
    pub display: DisplayConfig,

    /// Simulated spectrometer
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "SpecBreeze".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: dirs::home_dir()
                .map(|d| d.join("specbreeze").join("spectra_data"))
                .unwrap_or_else(|| PathBuf::from("./spectra_data")),
            log_level: "info".to_string(),
            capabilities: Capabilities::default(),
            spectrometer: SpectrometerConfig::default(),
            auto_integration: AutoIntegrationConfig::default(),
            channels: ChannelConfig::default(),
            display: DisplayConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("specbreeze"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Reject values that parse but cannot work together
    pub fn validate(&self) -> Result<()> {
        let s = &self.spectrometer;
        if s.min_integration_time_us == 0 || s.min_integration_time_us > s.max_integration_time_us {
            bail!(
                "integration range {}..={} us is empty",
                s.min_integration_time_us,
                s.max_integration_time_us
            );
        }
        if s.hw_min_integration_us == 0 || s.hw_min_integration_us > s.hw_max_integration_us {
            bail!(
                "hardware integration range {}..={} us is empty",
                s.hw_min_integration_us,
                s.hw_max_integration_us
            );
        }
        if !(s.min_integration_time_us..=s.max_integration_time_us).contains(&s.default_integration_time_us) {
            bail!("default integration time {} us outside the allowed range", s.default_integration_time_us);
        }
        if s.integration_step_us > s.max_integration_time_us - s.min_integration_time_us {
            bail!("integration step {} us is wider than the allowed range", s.integration_step_us);
        }
        if s.default_scans_to_average > s.max_scans_to_average {
            bail!("default scans to average exceeds the maximum of {}", s.max_scans_to_average);
        }
        if s.max_adc_count <= 0.0 {
            bail!("max ADC count must be positive");
        }

        let a = &self.auto_integration;
        if !(0.0 < a.target_low_percent && a.target_low_percent < a.target_high_percent && a.target_high_percent <= 100.0) {
            bail!(
                "auto-integration target window {}%..{}% is invalid",
                a.target_low_percent,
                a.target_high_percent
            );
        }
        if a.proportional_gain <= 0.0 || !(0.0..=1.0).contains(&a.oscillation_damping_factor) {
            bail!("auto-integration gain and damping must be positive, damping at most 1");
        }

        let c = &self.channels;
        if c.command_capacity == 0 || c.result_capacity == 0 || c.save_capacity == 0 {
            bail!("channel capacities must be non-zero");
        }

        if self.simulator.pixels == 0 {
            bail!("simulator needs at least one pixel");
        }
        Ok(())
    }

    /// Settings the worker starts with
    pub fn initial_settings(&self) -> SpectrometerSettings {
        SpectrometerSettings {
            integration_time_us: self.spectrometer.default_integration_time_us,
            scans_to_average: self.spectrometer.default_scans_to_average,
            collection_mode: self.spectrometer.default_collection_mode,
        }
    }
}

/// Which optional hardware exists on this unit.
///
/// Resolved once at startup and passed into constructors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Capabilities {
    /// USB spectrometer attached
    pub spectrometer: bool,

    /// Temperature sensor available for tagging captures
    pub temperature_sensor: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            spectrometer: true,
            temperature_sensor: false,
        }
    }
}

/// Spectrometer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrometerConfig {
    /// Integration time at startup
    pub default_integration_time_us: u32,

    /// Smallest integration time the user may select
    pub min_integration_time_us: u32,

    /// Largest integration time the user may select
    pub max_integration_time_us: u32,

    /// Menu step for integration time
    pub integration_step_us: u32,

    /// Averaging at startup
    pub default_scans_to_average: u32,

    /// Largest averaging accepted
    pub max_scans_to_average: u32,

    /// Mode at startup
    pub default_collection_mode: CollectionMode,

    /// Optics fitted to the probe
    pub lens_type: LensType,

    /// Hardware limits used when the device cannot report its own
    pub hw_min_integration_us: u32,

    /// Fallback longest exposure
    pub hw_max_integration_us: u32,

    /// Full-scale ADC count (14-bit detectors read 0..=16383)
    pub max_adc_count: f64,
}

impl Default for SpectrometerConfig {
    fn default() -> Self {
        Self {
            default_integration_time_us: 1_000_000,
            min_integration_time_us: 100_000,
            max_integration_time_us: 6_000_000,
            integration_step_us: 50_000,
            default_scans_to_average: 1,
            max_scans_to_average: 50,
            default_collection_mode: CollectionMode::Raw,
            lens_type: LensType::Fiber,
            hw_min_integration_us: 3800,
            hw_max_integration_us: 6_000_000,
            max_adc_count: 16383.0,
        }
    }
}

impl SpectrometerConfig {
    /// Integration times offered to the user
    pub fn integration_range(&self) -> IntegrationRange {
        IntegrationRange {
            min_us: self.min_integration_time_us,
            max_us: self.max_integration_time_us,
            step_us: self.integration_step_us,
        }
    }
}

/// User-selectable integration times: a range walked in fixed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationRange {
    /// Shortest selectable exposure
    pub min_us: u32,
    /// Longest selectable exposure
    pub max_us: u32,
    /// Menu step; 0 disables snapping
    pub step_us: u32,
}

impl IntegrationRange {
    /// Round to the nearest step, then clamp into the range
    pub fn snap(&self, integration_us: u32) -> u32 {
        let snapped = if self.step_us > 0 {
            let step = self.step_us as u64;
            let rounded = (integration_us as u64 + step / 2) / step * step;
            rounded.min(u32::MAX as u64) as u32
        } else {
            integration_us
        };
        snapped.clamp(self.min_us, self.max_us)
    }
}

/// Auto-integration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoIntegrationConfig {
    /// Lower edge of the accepted peak window, percent of full scale
    pub target_low_percent: f64,

    /// Upper edge of the accepted peak window, percent of full scale
    pub target_high_percent: f64,

    /// Probe budget per search
    pub max_iterations: u32,

    /// Fraction of the correction applied per step
    pub proportional_gain: f64,

    /// Smallest step the search will take
    pub min_adjustment_us: u32,

    /// Applied to the step whenever its direction flips
    pub oscillation_damping_factor: f64,

    /// Extra time allowed on top of the exposure before a probe counts as lost
    pub probe_timeout_margin_ms: u64,
}

impl Default for AutoIntegrationConfig {
    fn default() -> Self {
        Self {
            target_low_percent: 80.0,
            target_high_percent: 95.0,
            max_iterations: 20,
            proportional_gain: 0.8,
            min_adjustment_us: 50,
            oscillation_damping_factor: 0.5,
            probe_timeout_margin_ms: 2000,
        }
    }
}

/// Queue capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Command queue capacity
    pub command_capacity: usize,
    /// Event queue capacity
    pub result_capacity: usize,
    /// Save queue capacity
    pub save_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_capacity: 32,
            result_capacity: 8,
            save_capacity: 16,
        }
    }
}

/// Plot scaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// RAW y-axis ceiling before any rescale
    pub y_axis_default_max: f64,
    /// REFLECTANCE y-axis ceiling before any rescale
    pub y_axis_reflectance_default_max: f64,
    /// Headroom multiplier over the peak
    pub y_axis_rescale_factor: f64,
    /// Lowest RAW ceiling a rescale may set
    pub y_axis_min_ceiling: f64,
    /// Lowest REFLECTANCE ceiling a rescale may set
    pub y_axis_reflectance_min_ceiling: f64,
    /// Highest REFLECTANCE ceiling a rescale may set
    pub y_axis_reflectance_max_ceiling: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            y_axis_default_max: 1000.0,
            y_axis_reflectance_default_max: 10.0,
            y_axis_rescale_factor: 1.2,
            y_axis_min_ceiling: 100.0,
            y_axis_reflectance_min_ceiling: 0.2,
            y_axis_reflectance_max_ceiling: 200.0,
        }
    }
}

/// Simulated spectrometer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Wavelength bins
    pub pixels: usize,
    /// First bin, in nanometres
    pub wavelength_start_nm: f64,
    /// Last bin, in nanometres
    pub wavelength_end_nm: f64,

    /// Counts accumulated per microsecond at the lamp peak
    pub counts_per_us: f64,

    /// Read noise standard deviation, in counts
    pub noise_std: f64,
    /// Dark offset, in counts
    pub dark_level: f64,

    /// Real seconds slept per second of exposure; 0 disables sleeping
    pub time_scale: f64,

    /// Flat noise-free response instead of the lamp model
    pub linear_response: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            pixels: 2048,
            wavelength_start_nm: 339.0,
            wavelength_end_nm: 1019.0,
            counts_per_us: 0.006,
            noise_std: 4.0,
            dark_level: 420.0,
            time_scale: 1.0,
            linear_response: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let settings = config.initial_settings();
        assert_eq!(settings.integration_time_us, 1_000_000);
        assert_eq!(settings.collection_mode, CollectionMode::Raw);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        config.auto_integration.max_iterations = 7;
        config.spectrometer.default_collection_mode = CollectionMode::Reflectance;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.auto_integration.max_iterations, 7);
        assert_eq!(loaded.spectrometer.default_collection_mode, CollectionMode::Reflectance);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[auto_integration]\nmax_iterations = 3\n").unwrap();
        assert_eq!(config.auto_integration.max_iterations, 3);
        assert_eq!(config.auto_integration.target_high_percent, 95.0);
        assert_eq!(config.channels.result_capacity, 8);
    }

    #[test]
    fn test_invalid_target_window_rejected() {
        let mut config = Config::default();
        config.auto_integration.target_low_percent = 96.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.channels.command_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_integration_range_snaps_and_clamps() {
        let range = SpectrometerConfig::default().integration_range();
        assert_eq!(range.snap(1_000_000), 1_000_000);
        assert_eq!(range.snap(1_024_999), 1_000_000);
        assert_eq!(range.snap(1_025_000), 1_050_000);
        assert_eq!(range.snap(3800), 100_000);
        assert_eq!(range.snap(u32::MAX), 6_000_000);

        let unstepped = IntegrationRange { step_us: 0, ..range };
        assert_eq!(unstepped.snap(123_456), 123_456);
    }

    #[test]
    fn test_step_wider_than_range_rejected() {
        let mut config = Config::default();
        config.spectrometer.integration_step_us = 10_000_000;
        assert!(config.validate().is_err());
    }
}
