// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Persistence boundary
//!
//! Accepted captures leave the core as [`SaveRequest`]s over a bounded,
//! write-only queue. Whatever drains it (CSV logging, plotting) lives
//! outside this crate's core.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::acquisition::{CollectionMode, SpectraType, SpectrometerResult};
use crate::error::{AcquisitionError, AcquisitionResult};

/// Optics in front of the spectrometer, recorded with every save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LensType {
    /// Bare fibre
    #[serde(rename = "FIBER")]
    Fiber,
    /// Cable
    #[serde(rename = "CABLE")]
    Cable,
    /// Fibre with cable
    #[serde(rename = "FIBER+CABLE")]
    FiberCable,
}

impl LensType {
    /// Every lens type, in cycling order
    pub const ALL: [LensType; 3] = [LensType::Fiber, LensType::Cable, LensType::FiberCable];

    /// Next entry in menu order, wrapping around
    pub fn next(self) -> Self {
        match self {
            LensType::Fiber => LensType::Cable,
            LensType::Cable => LensType::FiberCable,
            LensType::FiberCable => LensType::Fiber,
        }
    }
}

impl fmt::Display for LensType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensType::Fiber => write!(f, "FIBER"),
            LensType::Cable => write!(f, "CABLE"),
            LensType::FiberCable => write!(f, "FIBER+CABLE"),
        }
    }
}

/// One capture to be written to disk
#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Bin wavelengths
    pub wavelengths: Arc<[f64]>,
    /// Intensities as displayed
    pub intensities: Vec<f64>,
    /// Counts the reflectance was derived from
    pub raw_intensities: Option<Vec<f64>>,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Exposure in milliseconds
    pub integration_time_ms: u32,
    /// Additional exposures averaged in
    pub scans_to_average: u32,
    /// Kind of spectrum
    pub spectra_type: SpectraType,
    /// Mode of the capture
    pub collection_mode: CollectionMode,
    /// Optics fitted
    pub lens_type: LensType,
    /// Ambient temperature, when a sensor exists
    pub temperature_c: Option<f64>,
}

impl SaveRequest {
    /// Build a request from a valid capture
    pub fn from_result(
        result: &SpectrometerResult,
        lens_type: LensType,
        temperature_c: Option<f64>,
    ) -> AcquisitionResult<Self> {
        if !result.is_valid {
            return Err(AcquisitionError::InvalidCapture {
                ticket: result.ticket,
                reason: result
                    .error
                    .as_ref()
                    .map_or_else(|| "no data".to_string(), |e| e.to_string()),
            });
        }
        Ok(Self {
            wavelengths: Arc::clone(&result.wavelengths),
            intensities: result.intensities.clone(),
            raw_intensities: result.raw_intensities.clone(),
            timestamp: result.timestamp,
            integration_time_ms: result.integration_time_ms(),
            scans_to_average: result.scans_to_average,
            spectra_type: result.spectra_type,
            collection_mode: result.collection_mode,
            lens_type,
            temperature_c,
        })
    }

    /// Date-scoped folder name, `YYYY-MM-DD` (UTC)
    pub fn day_folder(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    /// Folder this request belongs in under `data_dir`
    pub fn day_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.day_folder())
    }

    /// Only live spectra get a plot; references are logged but not plotted
    pub fn wants_plot(&self) -> bool {
        self.spectra_type.is_plottable()
    }
}

/// Create the save queue
pub fn save_queue(capacity: usize) -> (SaveQueue, SaveReceiver) {
    let (tx, rx) = channel::bounded(capacity);
    (SaveQueue { tx }, SaveReceiver { rx })
}

/// Write-only sender. There is no return channel.
#[derive(Debug, Clone)]
pub struct SaveQueue {
    tx: Sender<SaveRequest>,
}

impl SaveQueue {
    /// Enqueue without blocking
    pub fn submit(&self, request: SaveRequest) -> AcquisitionResult<()> {
        let spectra_type = request.spectra_type;
        match self.tx.try_send(request) {
            Ok(()) => {
                debug!("Queued {} capture for saving", spectra_type);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("Save queue full, {} capture not saved", spectra_type);
                Err(AcquisitionError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(AcquisitionError::Disconnected),
        }
    }
}

/// The collaborator's end of the save queue
#[derive(Debug)]
pub struct SaveReceiver {
    rx: Receiver<SaveRequest>,
}

impl SaveReceiver {
    /// Wait up to `timeout` for the next request; `None` on timeout or when every sender is gone
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SaveRequest> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<SaveRequest> {
        self.rx.try_iter().collect()
    }

    /// Blocks until every [`SaveQueue`] is dropped
    pub fn iter(&self) -> impl Iterator<Item = SaveRequest> + '_ {
        self.rx.iter()
    }
}
