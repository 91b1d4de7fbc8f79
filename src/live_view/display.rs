// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Y-axis scaling for the live plot

use tracing::debug;

use crate::acquisition::CollectionMode;
use crate::config::DisplayConfig;

/// Current y-axis ceiling plus the rules for moving it
#[derive(Debug, Clone)]
pub struct DisplayScale {
    config: DisplayConfig,
    max_adc_count: f64,
    mode: CollectionMode,
    y_max: f64,
    rescale_pending: bool,
}

impl DisplayScale {
    /// Scale at the default ceiling for `mode`
    pub fn new(config: DisplayConfig, max_adc_count: f64, mode: CollectionMode) -> Self {
        let mut scale = Self {
            config,
            max_adc_count,
            mode,
            y_max: 0.0,
            rescale_pending: false,
        };
        scale.reset(mode);
        scale
    }

    /// Current ceiling
    pub fn y_max(&self) -> f64 {
        self.y_max
    }

    /// Mode the ceiling belongs to
    pub fn mode(&self) -> CollectionMode {
        self.mode
    }

    /// Back to the default ceiling for `mode`
    pub fn reset(&mut self, mode: CollectionMode) {
        self.mode = mode;
        self.y_max = match mode {
            CollectionMode::Raw => self.config.y_axis_default_max,
            CollectionMode::Reflectance => self.config.y_axis_reflectance_default_max,
        };
    }

    /// Fit the ceiling to `intensities`. Returns the new ceiling.
    pub fn rescale(&mut self, intensities: &[f64]) -> f64 {
        let peak = intensities.iter().copied().fold(0.0, f64::max);
        let c = &self.config;
        let wanted = peak * c.y_axis_rescale_factor;

        self.y_max = match self.mode {
            CollectionMode::Raw => wanted
                .max(c.y_axis_min_ceiling)
                .min(self.max_adc_count * c.y_axis_rescale_factor),
            CollectionMode::Reflectance => wanted
                .max(c.y_axis_reflectance_min_ceiling)
                .min(c.y_axis_reflectance_max_ceiling),
        };
        debug!("Y-axis rescaled to {:.2} (peak {:.2})", self.y_max, peak);
        self.y_max
    }

    /// Rescale on the next accepted live result
    pub fn request_rescale(&mut self) {
        self.rescale_pending = true;
    }

    /// Whether a rescale waits for the next capture
    pub fn is_rescale_pending(&self) -> bool {
        self.rescale_pending
    }

    /// Apply a pending rescale, if any
    pub fn apply_pending(&mut self, intensities: &[f64]) -> Option<f64> {
        if !self.rescale_pending {
            return None;
        }
        self.rescale_pending = false;
        Some(self.rescale(intensities))
    }
}
