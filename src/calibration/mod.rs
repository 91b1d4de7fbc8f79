// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Calibration references and reflectance derivation

mod reflectance;

pub use reflectance::{compute_reflectance, DIVISION_EPSILON};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::acquisition::{SpectrometerResult, SpectrometerSettings};

/// Which baseline a reference provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceKind {
    /// Sensor response with no light (noise floor)
    Dark,
    /// Response to the white standard (ceiling)
    White,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Dark => write!(f, "dark"),
            ReferenceKind::White => write!(f, "white"),
        }
    }
}

/// An accepted baseline spectrum. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSpectrum {
    /// Averaged raw counts
    pub intensities: Vec<f64>,
    /// Exposure the reference is valid for
    pub integration_time_us: u32,
    /// Capture time
    pub captured_at: DateTime<Utc>,
}

/// Most recently accepted dark and white references.
///
/// Updates replace a reference wholesale; nothing is ever merged, so a
/// reader can never observe half of an old spectrum and half of a new one.
#[derive(Debug, Clone, Default)]
pub struct ReferenceStore {
    dark: Option<Arc<ReferenceSpectrum>>,
    white: Option<Arc<ReferenceSpectrum>>,
}

impl ReferenceStore {
    /// Store with no references
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a capture as the new reference of `kind`, overwriting any prior one
    pub fn accept_reference(&mut self, kind: ReferenceKind, result: &SpectrometerResult) {
        let reference = Arc::new(ReferenceSpectrum {
            intensities: result.intensities.clone(),
            integration_time_us: result.integration_time_us,
            captured_at: result.timestamp,
        });
        info!(
            "Accepted {} reference ({} bins at {} us)",
            kind,
            reference.intensities.len(),
            reference.integration_time_us
        );
        *self.slot_mut(kind) = Some(reference);
    }

    /// Stored reference regardless of whether it still matches the settings
    pub fn get(&self, kind: ReferenceKind) -> Option<&Arc<ReferenceSpectrum>> {
        match kind {
            ReferenceKind::Dark => self.dark.as_ref(),
            ReferenceKind::White => self.white.as_ref(),
        }
    }

    /// A reference is usable iff it exists and was captured at the active integration time
    pub fn is_valid(&self, kind: ReferenceKind, settings: &SpectrometerSettings) -> bool {
        self.usable(kind, settings).is_some()
    }

    /// The reference, if usable under `settings`
    pub fn usable(&self, kind: ReferenceKind, settings: &SpectrometerSettings) -> Option<&Arc<ReferenceSpectrum>> {
        self.get(kind)
            .filter(|r| r.integration_time_us == settings.integration_time_us)
    }

    /// References that are absent or stale under `settings`
    pub fn missing(&self, settings: &SpectrometerSettings) -> Vec<ReferenceKind> {
        [ReferenceKind::Dark, ReferenceKind::White]
            .into_iter()
            .filter(|&kind| !self.is_valid(kind, settings))
            .collect()
    }

    /// Both references usable under `settings`
    pub fn pair(&self, settings: &SpectrometerSettings) -> Option<(&ReferenceSpectrum, &ReferenceSpectrum)> {
        let dark = self.usable(ReferenceKind::Dark, settings)?;
        let white = self.usable(ReferenceKind::White, settings)?;
        Some((dark.as_ref(), white.as_ref()))
    }

    /// Drop both references
    pub fn clear(&mut self) {
        if self.dark.is_some() || self.white.is_some() {
            info!("Cleared dark and white references");
        }
        self.dark = None;
        self.white = None;
    }

    fn slot_mut(&mut self, kind: ReferenceKind) -> &mut Option<Arc<ReferenceSpectrum>> {
        match kind {
            ReferenceKind::Dark => &mut self.dark,
            ReferenceKind::White => &mut self.white,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{CollectionMode, SpectraType};

    fn settings(integration_time_us: u32) -> SpectrometerSettings {
        SpectrometerSettings {
            integration_time_us,
            scans_to_average: 0,
            collection_mode: CollectionMode::Reflectance,
        }
    }

    fn capture(kind: ReferenceKind, integration_time_us: u32, level: f64) -> SpectrometerResult {
        SpectrometerResult {
            wavelengths: vec![400.0, 500.0, 600.0].into(),
            intensities: vec![level; 3],
            raw_intensities: None,
            timestamp: Utc::now(),
            integration_time_us,
            scans_to_average: 0,
            collection_mode: CollectionMode::Raw,
            session_id: 1,
            ticket: 1,
            spectra_type: kind.into(),
            peak_value: None,
            test_integration_us: None,
            is_valid: true,
            error: None,
        }
    }

    #[test]
    fn test_validity_follows_integration_time() {
        let mut store = ReferenceStore::new();
        assert!(!store.is_valid(ReferenceKind::Dark, &settings(1000)));

        store.accept_reference(ReferenceKind::Dark, &capture(ReferenceKind::Dark, 1000, 10.0));
        store.accept_reference(ReferenceKind::White, &capture(ReferenceKind::White, 1000, 110.0));
        assert!(store.is_valid(ReferenceKind::Dark, &settings(1000)));
        assert!(store.is_valid(ReferenceKind::White, &settings(1000)));
        assert!(store.pair(&settings(1000)).is_some());

        assert!(!store.is_valid(ReferenceKind::Dark, &settings(2000)));
        assert!(!store.is_valid(ReferenceKind::White, &settings(2000)));
        assert_eq!(store.missing(&settings(2000)), vec![ReferenceKind::Dark, ReferenceKind::White]);
    }

    #[test]
    fn test_accept_overwrites_wholesale() {
        let mut store = ReferenceStore::new();
        store.accept_reference(ReferenceKind::White, &capture(ReferenceKind::White, 1000, 110.0));
        let first = Arc::clone(store.get(ReferenceKind::White).unwrap());

        store.accept_reference(ReferenceKind::White, &capture(ReferenceKind::White, 2000, 220.0));
        let second = store.get(ReferenceKind::White).unwrap();
        assert_eq!(second.intensities, vec![220.0; 3]);
        assert_eq!(second.integration_time_us, 2000);

        // Earlier snapshot untouched
        assert_eq!(first.intensities, vec![110.0; 3]);
        assert_eq!(store.missing(&settings(2000)), vec![ReferenceKind::Dark]);
        assert_eq!(SpectraType::from(ReferenceKind::White), SpectraType::White);
    }

    #[test]
    fn test_clear() {
        let mut store = ReferenceStore::new();
        store.accept_reference(ReferenceKind::Dark, &capture(ReferenceKind::Dark, 1000, 10.0));
        store.clear();
        assert!(store.get(ReferenceKind::Dark).is_none());
        assert!(store.pair(&settings(1000)).is_none());
    }
}
