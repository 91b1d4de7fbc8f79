// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Hardware layer - spectrometer driver boundary and simulation

mod simulator;

pub use simulator::{ResponseModel, SceneControl, SceneTarget, SimulatedSpectrometer, SimulatorDriver};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AcquisitionError;

/// Errors raised by a spectrometer driver
#[derive(Error, Debug)]
pub enum HardwareError {
    /// No device could be found or opened
    #[error("no spectrometer found: {0}")]
    NoDevice(String),

    /// The device went away
    #[error("spectrometer disconnected")]
    Disconnected,

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device answered with something unusable
    #[error("invalid data from spectrometer: {0}")]
    InvalidData(String),
}

/// Inclusive integration time range a device accepts, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationLimits {
    min_us: u32,
    max_us: u32,
}

impl IntegrationLimits {
    /// Build a range, rejecting empty or zero-based ones
    pub fn new(min_us: u32, max_us: u32) -> Result<Self, AcquisitionError> {
        if min_us == 0 || min_us > max_us {
            return Err(AcquisitionError::InvalidSettings(format!(
                "unusable integration limits {}..={} us",
                min_us, max_us
            )));
        }
        Ok(Self { min_us, max_us })
    }

    /// Shortest exposure
    pub fn min_us(&self) -> u32 {
        self.min_us
    }

    /// Longest exposure
    pub fn max_us(&self) -> u32 {
        self.max_us
    }

    /// Nearest exposure inside the range
    pub fn clamp(&self, integration_us: u32) -> u32 {
        integration_us.clamp(self.min_us, self.max_us)
    }

    /// Whether the exposure is inside the range
    pub fn contains(&self, integration_us: u32) -> bool {
        (self.min_us..=self.max_us).contains(&integration_us)
    }
}

/// Static description of an opened device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model name
    pub model: String,
    /// Serial number
    pub serial_number: String,
    /// Exposures the device accepts
    pub integration_limits: IntegrationLimits,
    /// Full-scale ADC count; the auto-integration targets are percentages of it
    pub max_adc_count: f64,
}

/// An opened spectrometer. Owned by exactly one thread at a time.
pub trait SpectrometerDevice: Send {
    /// Device identity and limits
    fn info(&self) -> &DeviceInfo;

    /// Wavelength table in nm, fixed for the lifetime of the handle
    fn wavelengths(&self) -> &[f64];

    /// Perform one exposure and return raw counts, one per wavelength bin.
    ///
    /// Blocks for roughly `integration_time_us`.
    fn read(&mut self, integration_time_us: u32) -> Result<Vec<f64>, HardwareError>;

    /// Release the device
    fn close(&mut self) -> Result<(), HardwareError>;
}

/// Something that can open a spectrometer
pub trait SpectrometerDriver {
    type Device: SpectrometerDevice + 'static;

    /// Open the device for exclusive use
    fn open(&mut self) -> Result<Self::Device, HardwareError>;
}
