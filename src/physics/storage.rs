//! Piecewise-linear storage curves mapping reservoir volume to water level.

use serde::{Deserialize, Serialize};

use crate::errors::ComponentError;
use crate::numerics::interp;

/// An ordered sequence of `(volume, level)` pairs with strictly increasing
/// volumes. Supports interpolation in both directions plus a local surface
/// area estimate from the secant slope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCurve {
    volumes: Vec<f64>,
    levels: Vec<f64>,
}

impl StorageCurve {
    /// Builds a curve from `(volume, level)` pairs. The points are sorted
    /// by volume; volumes must then be strictly increasing and at least two
    /// points are required.
    pub fn new(points: &[(f64, f64)]) -> Result<Self, ComponentError> {
        if points.len() < 2 {
            return Err(ComponentError::InvalidStorageCurve(
                "a storage curve needs at least two (volume, level) points".to_string(),
            ));
        }

        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        for pair in sorted.windows(2) {
            if pair[1].0 - pair[0].0 <= 0.0 {
                return Err(ComponentError::InvalidStorageCurve(
                    "volumes must be strictly increasing".to_string(),
                ));
            }
        }

        Ok(StorageCurve {
            volumes: sorted.iter().map(|p| p.0).collect(),
            levels: sorted.iter().map(|p| p.1).collect(),
        })
    }

    /// Water level for a given volume.
    pub fn level_for(&self, volume: f64) -> f64 {
        interp(volume, &self.volumes, &self.levels)
    }

    /// Volume for a given water level (inverse interpolation).
    pub fn volume_for(&self, level: f64) -> f64 {
        interp(level, &self.levels, &self.volumes)
    }

    /// Local surface area, estimated as the secant slope dV/dL of the
    /// segment containing `volume`. Flat segments fall back to the
    /// previous segment, then to a small positive area.
    pub fn surface_area_at(&self, volume: f64) -> f64 {
        let mut idx = self.volumes.partition_point(|&v| v <= volume);
        idx = idx.clamp(1, self.volumes.len() - 1);

        let dv = self.volumes[idx] - self.volumes[idx - 1];
        let dl = self.levels[idx] - self.levels[idx - 1];
        if dl > 1e-6 {
            return dv / dl;
        }

        if idx > 1 {
            let dv_prev = self.volumes[idx - 1] - self.volumes[idx - 2];
            let dl_prev = self.levels[idx - 1] - self.levels[idx - 2];
            if dl_prev > 1e-6 {
                return dv_prev / dl_prev;
            }
        }
        1.0
    }

    /// The curve as `(volume, level)` pairs, volume-ascending.
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.volumes
            .iter()
            .copied()
            .zip(self.levels.iter().copied())
            .collect()
    }

    pub fn volumes(&self) -> &[f64] {
        &self.volumes
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }
}
