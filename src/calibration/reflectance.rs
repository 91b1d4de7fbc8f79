// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Reflectance derivation

/// Floor applied to `white - dark` before dividing
pub const DIVISION_EPSILON: f64 = 1e-9;

/// Normalise raw counts against dark and white references.
///
/// `reflectance = max(0, (raw - dark) / max(white - dark, ε))`, elementwise.
/// Values above 1.0 are kept: fluorescence and specular highlights can
/// legitimately exceed the white standard.
///
/// # Panics
///
/// If the slices differ in length. The sensor fixes the bin count for the
/// lifetime of the device handle, so a mismatch is a programming error.
pub fn compute_reflectance(raw: &[f64], dark: &[f64], white: &[f64]) -> Vec<f64> {
    assert_eq!(raw.len(), dark.len(), "raw and dark spectra differ in length");
    assert_eq!(raw.len(), white.len(), "raw and white spectra differ in length");

    raw.iter()
        .zip(dark)
        .zip(white)
        .map(|((&r, &d), &w)| {
            let denominator = (w - d).max(DIVISION_EPSILON);
            ((r - d) / denominator).max(0.0)
        })
        .collect()
}
