// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! SpecBreeze - Spectrometer Acquisition Controller
//!
//! Concurrent acquisition core for scanning USB spectrometers:
//! - A single worker thread owns the device and performs every blocking exposure
//! - Numbered capture sessions let consumers drop stale multi-second exposures
//! - Dark/white references and reflectance normalisation
//! - Closed-loop auto-integration towards a target peak level
//! - Bounded queues everywhere, with coalescing instead of blocking
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Client side                              │
//! │  ┌───────────┐   ┌──────────────────┐   ┌────────────────┐   │
//! │  │ Live View │   │ Auto-Integration │   │  Save Queue    │   │
//! │  │ + Filter  │   │ Runner           │   │  (write-only)  │   │
//! │  └───────────┘   └──────────────────┘   └────────────────┘   │
//! │        │  commands ↓        ↑ events (spectra + acks)         │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │        bounded command queue / bounded event queue     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        ↓                     ↑                               │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Acquisition Worker: sessions, averaging, references,   │  │
//! │  │ reflectance                                            │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        ↓                                                     │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Spectrometer device (hardware or simulator)            │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod acquisition;
pub mod auto_integration;
pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod live_view;
pub mod persistence;

// Re-exports for convenience
pub use acquisition::{
    CollectionMode, SessionFilter, SpectraType, SpectrometerClient, SpectrometerCommand, SpectrometerResult,
    SpectrometerSettings, WorkerHandle, WorkerOptions,
};
pub use auto_integration::{AutoIntegrationController, AutoIntegrationParams, AutoIntegrationRunner};
pub use calibration::{compute_reflectance, ReferenceKind, ReferenceStore};
pub use config::Config;
pub use error::{AcquisitionError, AcquisitionResult};
pub use live_view::{DisplayScale, LiveView};
pub use persistence::{LensType, SaveQueue, SaveRequest};

/// SpecBreeze version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// SpecBreeze name
pub const NAME: &str = "SpecBreeze";

/// Build info
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
    }
}

/// Build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    /// Version string
    pub version: String,
    /// Minimum supported Rust version
    pub rust_version: String,
    /// Target architecture
    pub target: String,
    /// Operating system
    pub os: String,
}
