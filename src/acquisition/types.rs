// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Commands, results and settings exchanged with the acquisition worker

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SessionId, Ticket};
use crate::calibration::ReferenceKind;
use crate::error::AcquisitionError;

/// What live captures produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionMode {
    /// Raw ADC counts
    Raw,
    /// Counts normalised against dark and white references
    Reflectance,
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionMode::Raw => write!(f, "RAW"),
            CollectionMode::Reflectance => write!(f, "REFLECTANCE"),
        }
    }
}

/// Kind of spectrum carried by a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpectraType {
    /// Live raw counts
    Raw,
    /// Live reflectance
    Reflectance,
    /// Dark reference
    Dark,
    /// White reference
    White,
    /// Single auto-integration trial exposure
    AutoProbe,
}

impl SpectraType {
    /// Whether the persistence collaborator renders a plot for this kind
    pub fn is_plottable(&self) -> bool {
        matches!(self, SpectraType::Raw | SpectraType::Reflectance)
    }
}

impl From<ReferenceKind> for SpectraType {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Dark => SpectraType::Dark,
            ReferenceKind::White => SpectraType::White,
        }
    }
}

impl fmt::Display for SpectraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpectraType::Raw => "RAW",
            SpectraType::Reflectance => "REFLECTANCE",
            SpectraType::Dark => "DARK",
            SpectraType::White => "WHITE",
            SpectraType::AutoProbe => "AUTO_PROBE",
        };
        f.write_str(name)
    }
}

/// Capture settings. Created once at startup, mutated only by the worker's command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrometerSettings {
    /// Exposure per read, in microseconds
    pub integration_time_us: u32,
    /// Additional exposures averaged into each capture; 0 means a single exposure
    pub scans_to_average: u32,
    /// What live captures produce
    pub collection_mode: CollectionMode,
}

impl SpectrometerSettings {
    /// Exposures making up one averaged capture
    pub fn exposures_per_capture(&self) -> u32 {
        self.scans_to_average.saturating_add(1)
    }

    /// Upper bound of the time the worker blocks on one capture
    pub fn capture_duration(&self) -> Duration {
        Duration::from_micros(self.integration_time_us as u64 * self.exposures_per_capture() as u64)
    }
}

/// Commands accepted by the acquisition worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpectrometerCommand {
    /// Arm a new capture session
    StartSession,
    /// Disarm; an exposure already running still completes
    StopSession,
    /// Change exposure and averaging; clears references when either changes
    UpdateSettings {
        /// Requested exposure, clamped by the worker
        integration_time_us: u32,
        /// Additional exposures per capture
        scans_to_average: u32,
    },
    /// Switch between RAW and REFLECTANCE
    SetCollectionMode {
        /// New mode
        mode: CollectionMode,
    },
    /// Capture and accept a dark reference
    CaptureDarkReference,
    /// Capture and accept a white reference
    CaptureWhiteReference,
    /// Single RAW exposure at a trial integration time, no averaging
    AutoIntegrationProbe {
        /// Requested trial exposure, clamped by the worker
        test_integration_us: u32,
    },
    /// Stop the worker and close the device
    Shutdown,
}

impl SpectrometerCommand {
    /// Commands that can change the session id or the armed state
    pub fn is_session_affecting(&self) -> bool {
        !matches!(self, SpectrometerCommand::AutoIntegrationProbe { .. })
    }

    /// Variant name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SpectrometerCommand::StartSession => "StartSession",
            SpectrometerCommand::StopSession => "StopSession",
            SpectrometerCommand::UpdateSettings { .. } => "UpdateSettings",
            SpectrometerCommand::SetCollectionMode { .. } => "SetCollectionMode",
            SpectrometerCommand::CaptureDarkReference => "CaptureDarkReference",
            SpectrometerCommand::CaptureWhiteReference => "CaptureWhiteReference",
            SpectrometerCommand::AutoIntegrationProbe { .. } => "AutoIntegrationProbe",
            SpectrometerCommand::Shutdown => "Shutdown",
        }
    }
}

/// One capture posted by the worker
#[derive(Debug, Clone)]
pub struct SpectrometerResult {
    /// Wavelength table in nm, shared for the lifetime of the device handle
    pub wavelengths: Arc<[f64]>,
    /// Counts, or reflectance in REFLECTANCE mode. Empty when invalid.
    pub intensities: Vec<f64>,
    /// Pre-normalisation counts, present only for reflectance results
    pub raw_intensities: Option<Vec<f64>>,
    /// When the capture completed
    pub timestamp: DateTime<Utc>,
    /// Exposure the capture was taken at
    pub integration_time_us: u32,
    /// Additional exposures averaged in
    pub scans_to_average: u32,
    /// Mode the capture was taken in
    pub collection_mode: CollectionMode,
    /// Session armed when the capture started
    pub session_id: SessionId,
    /// Command that caused the capture
    pub ticket: Ticket,
    /// What the intensities are
    pub spectra_type: SpectraType,
    /// Highest single-bin count, for auto-integration probes
    pub peak_value: Option<f64>,
    /// Clamped trial exposure, for auto-integration probes
    pub test_integration_us: Option<u32>,
    /// False when a read failed; intensities are empty then
    pub is_valid: bool,
    /// The failure, for invalid captures
    pub error: Option<AcquisitionError>,
}

impl SpectrometerResult {
    /// Exposure rounded down to milliseconds
    pub fn integration_time_ms(&self) -> u32 {
        (self.integration_time_us + 500) / 1000
    }

    /// Largest intensity, `None` for empty results
    pub fn max_intensity(&self) -> Option<f64> {
        self.intensities.iter().copied().reduce(f64::max)
    }
}

/// How the worker disposed of a command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Command carried out
    Applied,
    /// Reflectance capture refused: the listed references are absent or stale
    CalibrationRequired {
        /// References absent or captured at other settings
        missing: Vec<ReferenceKind>,
    },
    /// Command refused; state unchanged unless noted by the ack
    Rejected(AcquisitionError),
}

/// Answer to every command, posted once the worker is done with it
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    /// Ticket of the acknowledged command
    pub ticket: Ticket,
    /// The command itself
    pub command: SpectrometerCommand,
    /// Session id current after the command
    pub session_id: SessionId,
    /// Whether live captures are armed after the command
    pub armed: bool,
    /// Settings in force after the command
    pub settings: SpectrometerSettings,
    /// How it went
    pub outcome: CommandOutcome,
}

impl CommandAck {
    /// Whether the worker refused for lack of references
    pub fn calibration_required(&self) -> bool {
        matches!(self.outcome, CommandOutcome::CalibrationRequired { .. })
    }
}

/// Everything flowing from the worker to its clients
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A capture
    Spectrum(SpectrometerResult),
    /// A command acknowledgement
    Ack(CommandAck),
}
