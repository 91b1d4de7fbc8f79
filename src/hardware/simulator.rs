// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Simulated spectrometer for demo/testing

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::prelude::*;
use rand_distr::Normal;
use tracing::{debug, info};

use super::{DeviceInfo, HardwareError, IntegrationLimits, SpectrometerDevice, SpectrometerDriver};
use crate::config::{SimulatorConfig, SpectrometerConfig};

/// What the simulated probe is pointed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneTarget {
    /// Lamp off / probe capped
    Dark,
    /// White standard
    White,
    /// A sample with a wavelength-dependent reflectance
    Sample,
}

impl SceneTarget {
    fn reflectance(&self, wavelength_nm: f64) -> f64 {
        match self {
            SceneTarget::Dark => 0.0,
            SceneTarget::White => 1.0,
            // Greenish sample: low in the blue, peak around 540 nm
            SceneTarget::Sample => {
                let d = (wavelength_nm - 540.0) / 60.0;
                0.15 + 0.55 * (-d * d).exp()
            }
        }
    }
}

/// How counts scale with exposure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseModel {
    /// Gaussian lamp spectrum, dark offset and read noise
    Lamp {
        /// Peak counts per microsecond of exposure
        counts_per_us: f64,
        /// Read noise standard deviation
        noise_std: f64,
        /// Dark offset
        dark_level: f64,
    },
    /// Noise-free flat response: every bin reads `min(max_adc, k * t) * reflectance`
    Linear {
        /// Counts per microsecond of exposure
        counts_per_us: f64,
    },
}

#[derive(Debug)]
struct SceneState {
    target: SceneTarget,
    fail_next_reads: u32,
    /// Reads still allowed to succeed before `fail_next_reads` applies
    reads_before_failure: u32,
    reads: u64,
    last_integration_us: Option<u32>,
    connected: bool,
}

/// Shared handle onto the simulated world.
///
/// This is the scene in front of the probe, not the device: the device itself
/// stays owned by the acquisition worker.
#[derive(Debug, Clone)]
pub struct SceneControl {
    state: Arc<RwLock<SceneState>>,
}

impl Default for SceneControl {
    fn default() -> Self {
        Self::new(SceneTarget::Sample)
    }
}

impl SceneControl {
    /// Connected scene showing `target`
    pub fn new(target: SceneTarget) -> Self {
        Self {
            state: Arc::new(RwLock::new(SceneState {
                target,
                fail_next_reads: 0,
                reads_before_failure: 0,
                reads: 0,
                last_integration_us: None,
                connected: true,
            })),
        }
    }

    /// Point the probe at `target`
    pub fn set_target(&self, target: SceneTarget) {
        self.state.write().target = target;
    }

    /// What the probe points at
    pub fn target(&self) -> SceneTarget {
        self.state.read().target
    }

    /// Make the next `count` exposures fail with an I/O error
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads_after(0, count);
    }

    /// Let `ok` exposures succeed, then fail the following `count`
    pub fn fail_reads_after(&self, ok: u32, count: u32) {
        let mut state = self.state.write();
        state.reads_before_failure = ok;
        state.fail_next_reads = count;
    }

    /// Simulate pulling the USB cable (or plugging it back)
    pub fn set_connected(&self, connected: bool) {
        self.state.write().connected = connected;
    }

    /// Number of exposures performed so far, failed ones included
    pub fn reads(&self) -> u64 {
        self.state.read().reads
    }

    /// Integration time the device was last asked for
    pub fn last_integration_us(&self) -> Option<u32> {
        self.state.read().last_integration_us
    }
}

/// Opens [`SimulatedSpectrometer`]s from configuration
pub struct SimulatorDriver {
    simulator: SimulatorConfig,
    spectrometer: SpectrometerConfig,
    scene: SceneControl,
    seed: Option<u64>,
}

impl SimulatorDriver {
    /// Driver for the configured simulated device
    pub fn new(simulator: SimulatorConfig, spectrometer: SpectrometerConfig, scene: SceneControl) -> Self {
        Self {
            simulator,
            spectrometer,
            scene,
            seed: None,
        }
    }

    /// Use a fixed RNG seed for reproducible noise
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Handle onto the shared scene
    pub fn scene(&self) -> SceneControl {
        self.scene.clone()
    }
}

impl SpectrometerDriver for SimulatorDriver {
    type Device = SimulatedSpectrometer;

    fn open(&mut self) -> Result<SimulatedSpectrometer, HardwareError> {
        let sim = &self.simulator;
        if sim.pixels == 0 {
            return Err(HardwareError::InvalidData("empty wavelength table".to_string()));
        }

        let integration_limits = IntegrationLimits::new(
            self.spectrometer.hw_min_integration_us,
            self.spectrometer.hw_max_integration_us,
        )
        .map_err(|e| HardwareError::InvalidData(e.to_string()))?;

        let model = if sim.linear_response {
            ResponseModel::Linear {
                counts_per_us: sim.counts_per_us,
            }
        } else {
            ResponseModel::Lamp {
                counts_per_us: sim.counts_per_us,
                noise_std: sim.noise_std,
                dark_level: sim.dark_level,
            }
        };

        let span = sim.wavelength_end_nm - sim.wavelength_start_nm;
        let step = if sim.pixels > 1 { span / (sim.pixels - 1) as f64 } else { 0.0 };
        let wavelengths = (0..sim.pixels)
            .map(|i| sim.wavelength_start_nm + i as f64 * step)
            .collect();

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let device = SimulatedSpectrometer::new(
            DeviceInfo {
                model: "SIM-USB".to_string(),
                serial_number: format!("SIM{:05}", sim.pixels),
                integration_limits,
                max_adc_count: self.spectrometer.max_adc_count,
            },
            wavelengths,
            model,
            sim.time_scale,
            self.scene.clone(),
            rng,
        )?;

        info!(
            "Opened simulated spectrometer ({} pixels, {:.1}-{:.1} nm)",
            sim.pixels, sim.wavelength_start_nm, sim.wavelength_end_nm
        );
        Ok(device)
    }
}

/// Simulates a scanning spectrometer with realistic exposure behaviour
pub struct SimulatedSpectrometer {
    info: DeviceInfo,
    wavelengths: Vec<f64>,
    model: ResponseModel,
    time_scale: f64,
    scene: SceneControl,
    rng: StdRng,
    noise: Option<Normal<f64>>,
    open: bool,
}

impl SimulatedSpectrometer {
    /// Simulated device over `scene`
    pub fn new(
        info: DeviceInfo,
        wavelengths: Vec<f64>,
        model: ResponseModel,
        time_scale: f64,
        scene: SceneControl,
        rng: StdRng,
    ) -> Result<Self, HardwareError> {
        let noise = match model {
            ResponseModel::Lamp { noise_std, .. } if noise_std > 0.0 => Some(
                Normal::new(0.0, noise_std).map_err(|e| HardwareError::InvalidData(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            info,
            wavelengths,
            model,
            time_scale,
            scene,
            rng,
            noise,
            open: true,
        })
    }

    fn generate_counts(&mut self, integration_time_us: u32, target: SceneTarget) -> Vec<f64> {
        let max_adc = self.info.max_adc_count;
        let t = integration_time_us as f64;

        match self.model {
            ResponseModel::Linear { counts_per_us } => {
                let level = (counts_per_us * t).min(max_adc);
                self.wavelengths
                    .iter()
                    .map(|&w| level * target.reflectance(w))
                    .collect()
            }
            ResponseModel::Lamp {
                counts_per_us,
                dark_level,
                ..
            } => {
                let mut data = Vec::with_capacity(self.wavelengths.len());
                for &w in &self.wavelengths {
                    // Halogen-ish lamp approximated by a broad gaussian around 600 nm
                    let lamp = (-((w - 600.0) / 150.0).powi(2)).exp();
                    let mut counts = dark_level + counts_per_us * t * lamp * target.reflectance(w);
                    if let Some(noise) = self.noise {
                        counts += self.rng.sample::<f64, _>(noise);
                    }
                    data.push(counts.clamp(0.0, max_adc));
                }
                data
            }
        }
    }
}

impl SpectrometerDevice for SimulatedSpectrometer {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    fn read(&mut self, integration_time_us: u32) -> Result<Vec<f64>, HardwareError> {
        if !self.open {
            return Err(HardwareError::Disconnected);
        }

        let (target, fail, connected) = {
            let mut state = self.scene.state.write();
            state.reads += 1;
            state.last_integration_us = Some(integration_time_us);
            let fail = if state.reads_before_failure > 0 {
                state.reads_before_failure -= 1;
                false
            } else if state.fail_next_reads > 0 {
                state.fail_next_reads -= 1;
                true
            } else {
                false
            };
            (state.target, fail, state.connected)
        };

        if self.time_scale > 0.0 {
            let micros = (integration_time_us as f64 * self.time_scale) as u64;
            std::thread::sleep(Duration::from_micros(micros));
        }

        if !connected {
            return Err(HardwareError::Disconnected);
        }
        if fail {
            return Err(HardwareError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "USB transfer timed out",
            )));
        }

        debug!("Simulated exposure at {} us ({:?})", integration_time_us, target);
        Ok(self.generate_counts(integration_time_us, target))
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(linear: bool) -> SimulatorDriver {
        let simulator = SimulatorConfig {
            linear_response: linear,
            counts_per_us: 2.0,
            time_scale: 0.0,
            pixels: 64,
            ..SimulatorConfig::default()
        };
        SimulatorDriver::new(simulator, SpectrometerConfig::default(), SceneControl::new(SceneTarget::White))
            .with_seed(7)
    }

    #[test]
    fn test_linear_response_saturates() {
        let mut device = driver(true).open().unwrap();
        let counts = device.read(5000).unwrap();
        assert_eq!(counts.len(), device.wavelengths().len());
        assert!(counts.iter().all(|&c| (c - 10_000.0).abs() < 1e-9));

        let counts = device.read(100_000).unwrap();
        assert!(counts.iter().all(|&c| (c - 16383.0).abs() < 1e-9));
    }

    #[test]
    fn test_dark_target_reads_dark_level() {
        let mut drv = driver(false);
        let scene = drv.scene();
        let mut device = drv.open().unwrap();
        scene.set_target(SceneTarget::Dark);

        let counts = device.read(10_000).unwrap();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        let dark = SimulatorConfig::default().dark_level;
        assert!((mean - dark).abs() < 20.0);
    }

    #[test]
    fn test_injected_failures() {
        let mut drv = driver(true);
        let scene = drv.scene();
        let mut device = drv.open().unwrap();

        scene.fail_next_reads(1);
        assert!(device.read(5000).is_err());
        assert!(device.read(5000).is_ok());
        assert_eq!(scene.reads(), 2);
        assert_eq!(scene.last_integration_us(), Some(5000));

        scene.set_connected(false);
        assert!(matches!(device.read(5000), Err(HardwareError::Disconnected)));
    }

    #[test]
    fn test_empty_wavelength_table_rejected() {
        let simulator = SimulatorConfig {
            pixels: 0,
            ..SimulatorConfig::default()
        };
        let mut drv = SimulatorDriver::new(simulator, SpectrometerConfig::default(), SceneControl::default());
        assert!(drv.open().is_err());
    }
}
