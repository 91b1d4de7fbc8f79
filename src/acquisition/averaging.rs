// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Per-bin scan averaging

/// Running per-bin sum over a fixed number of bins
#[derive(Debug, Clone)]
pub struct ScanAccumulator {
    sum: Vec<f64>,
    scans: u32,
}

impl ScanAccumulator {
    /// Empty accumulator for `bins` wavelength bins
    pub fn new(bins: usize) -> Self {
        Self {
            sum: vec![0.0; bins],
            scans: 0,
        }
    }

    /// Add one exposure. Returns false (and ignores it) on a bin-count mismatch.
    pub fn add(&mut self, counts: &[f64]) -> bool {
        if counts.len() != self.sum.len() {
            return false;
        }
        for (acc, &c) in self.sum.iter_mut().zip(counts) {
            *acc += c;
        }
        self.scans += 1;
        true
    }

    /// Exposures added so far
    pub fn scans(&self) -> u32 {
        self.scans
    }

    /// Arithmetic mean per bin, `None` before the first exposure
    pub fn mean(self) -> Option<Vec<f64>> {
        if self.scans == 0 {
            return None;
        }
        let n = self.scans as f64;
        Some(self.sum.into_iter().map(|s| s / n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_of_three() {
        let mut acc = ScanAccumulator::new(1);
        assert!(acc.add(&[10.0]));
        assert!(acc.add(&[20.0]));
        assert!(acc.add(&[30.0]));
        assert_eq!(acc.scans(), 3);
        assert_eq!(acc.mean(), Some(vec![20.0]));
    }

    #[test]
    fn test_per_bin() {
        let mut acc = ScanAccumulator::new(3);
        acc.add(&[1.0, 100.0, 0.0]);
        acc.add(&[3.0, 300.0, 0.0]);
        assert_eq!(acc.mean(), Some(vec![2.0, 200.0, 0.0]));
    }

    #[test]
    fn test_empty_and_mismatch() {
        let mut acc = ScanAccumulator::new(2);
        assert!(!acc.add(&[1.0]));
        assert_eq!(acc.mean(), None);
    }
}
