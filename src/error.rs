// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Error types for the acquisition core
//!
//! Every failure here degrades to "no new valid data". None of them stop the
//! worker: a failed exposure becomes an invalid result, a refused command
//! becomes a rejected acknowledgement, and a saturated queue is reported back
//! to whoever tried to enqueue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::ReferenceKind;
use crate::acquisition::Ticket;

/// Convenience alias for results using the acquisition error type.
pub type AcquisitionResult<T> = std::result::Result<T, AcquisitionError>;

/// Errors surfaced by the worker, the channels and the client-side controllers
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcquisitionError {
    /// Device disconnect or I/O failure in the middle of an exposure
    #[error("hardware read failed: {0}")]
    HardwareRead(String),

    /// Settings that cannot be used even after clamping
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Reflectance requested without references captured at the active exposure
    #[error("calibration required, missing {missing:?} reference")]
    ReferenceUnavailable {
        /// References that are absent or captured at another integration time
        missing: Vec<ReferenceKind>,
    },

    /// A bounded queue is saturated; coalesce or retry later
    #[error("queue full")]
    QueueFull,

    /// The other end of a channel is gone
    #[error("acquisition worker disconnected")]
    Disconnected,

    /// No answer to a probe within its deadline
    #[error("no answer to command #{ticket} after {waited_ms} ms")]
    ProbeTimeout {
        /// Ticket of the unanswered command
        ticket: Ticket,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// A capture that failed cannot be saved or displayed
    #[error("capture #{ticket} is not valid: {reason}")]
    InvalidCapture {
        /// Ticket of the command that produced the capture
        ticket: Ticket,
        /// Why the capture failed
        reason: String,
    },

    /// The worker thread could not be started
    #[error("failed to start acquisition worker: {0}")]
    WorkerSpawn(String),

    /// The operation was cancelled by the user
    #[error("cancelled")]
    Cancelled,
}

impl From<crate::hardware::HardwareError> for AcquisitionError {
    fn from(err: crate::hardware::HardwareError) -> Self {
        AcquisitionError::HardwareRead(err.to_string())
    }
}
