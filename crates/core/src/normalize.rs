//! Rescale dB magnitudes into the [0, 1] display range.

use serde::{Deserialize, Serialize};

use crate::grid::Grid;

/// Global level statistics of a spectrogram and the derived display floor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DbStats {
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for DbStats {
    fn default() -> Self {
        Self::empty()
    }
}

impl DbStats {
    /// Identity element for [`DbStats::update`].
    pub fn empty() -> Self {
        Self {
            min_db: f32::INFINITY,
            max_db: f32::NEG_INFINITY,
        }
    }

    /// Statistics of a full buffer of cells.
    pub fn scan(cells: &[f32]) -> Self {
        let mut stats = Self::empty();
        stats.update(cells);
        stats
    }

    /// Fold another batch of cells into the running min/max.
    pub fn update(&mut self, cells: &[f32]) {
        for &v in cells {
            if v < self.min_db {
                self.min_db = v;
            }
            if v > self.max_db {
                self.max_db = v;
            }
        }
    }

    /// True until at least one cell has been seen.
    pub fn is_empty(&self) -> bool {
        self.min_db > self.max_db
    }

    /// Lowest level kept: `max(min, max - dynamic_range_db)`.
    pub fn floor_db(&self, dynamic_range_db: f64) -> f64 {
        (self.min_db as f64).max(self.max_db as f64 - dynamic_range_db)
    }

    pub fn scaler(&self, dynamic_range_db: f64) -> Normalizer {
        Normalizer {
            floor: self.floor_db(dynamic_range_db),
            max: self.max_db as f64,
        }
    }
}

/// Maps dB values into [0, 1] against a fixed floor and ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    floor: f64,
    max: f64,
}

impl Normalizer {
    pub fn floor_db(&self) -> f64 {
        self.floor
    }

    pub fn max_db(&self) -> f64 {
        self.max
    }

    /// Values at or below the floor map to 0, the maximum maps to exactly 1.
    /// A flat spectrogram (floor == max) maps everything to 0.
    pub fn apply(&self, value: f32) -> f32 {
        let span = self.max - self.floor;
        if span <= 0.0 {
            return 0.0;
        }
        (((value as f64) - self.floor) / span).clamp(0.0, 1.0) as f32
    }

    pub fn apply_in_place(&self, cells: &mut [f32]) {
        for v in cells.iter_mut() {
            *v = self.apply(*v);
        }
    }
}

/// Normalize a whole spectrogram.
///
/// Returns the normalized copy and the statistics it was scaled with.
pub fn normalize(matrix: &Grid, dynamic_range_db: f64) -> (Grid, DbStats) {
    let stats = DbStats::scan(matrix.as_slice());
    let scaler = stats.scaler(dynamic_range_db);
    let mut normalized = matrix.clone();
    scaler.apply_in_place(normalized.as_mut_slice());
    (normalized, stats)
}
