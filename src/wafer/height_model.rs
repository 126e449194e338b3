//! Parametric wafer height model used to pre-generate a height offset table.
//!
//! ```text
//! h(x, y) = a·x + b·y + (c0·r + c1·r²) · (d0 + d1·cos 4θ)
//! ```
//!
//! with `x`, `y` relative to the wafer centre (die (0, 0)), `r = √(x² + y²)` and
//! `θ = atan2(x, y)`. The linear terms model chuck tilt, the radial terms wafer bow,
//! and the `cos 4θ` term the four-fold warp seen on crystalline substrates.

use super::calibration::{HeightOffsetTable, WaferCalibration};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Coefficients of the height model. Heights are in µm for coordinates in µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightModel {
    /// Tilt along x
    #[serde(default)]
    pub a: f64,
    /// Tilt along y
    #[serde(default)]
    pub b: f64,
    /// Linear radial bow
    #[serde(default)]
    pub c0: f64,
    /// Quadratic radial bow
    #[serde(default)]
    pub c1: f64,
    /// Isotropic angular factor
    #[serde(default = "default_d0")]
    pub d0: f64,
    /// Four-fold angular factor
    #[serde(default)]
    pub d1: f64,
}

fn default_d0() -> f64 {
    1.0
}

impl Default for HeightModel {
    fn default() -> Self {
        Self {
            a: 0.0,
            b: 0.0,
            c0: 0.0,
            c1: 0.0,
            d0: default_d0(),
            d1: 0.0,
        }
    }
}

impl HeightModel {
    /// Height at `(x, y)` relative to the wafer centre.
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        let r = x.hypot(y);
        let theta = x.atan2(y);
        self.a * x
            + self.b * y
            + (self.c0 * r + self.c1 * r * r) * (self.d0 + self.d1 * (4.0 * theta).cos())
    }

    /// Evaluate the model at each die centre and collect a height offset table.
    pub fn sample_table(
        &self,
        dies: &[(i32, i32)],
        calibration: &WaferCalibration,
    ) -> AppResult<HeightOffsetTable> {
        let mut table = HeightOffsetTable::new();
        for &(die_x, die_y) in dies {
            let x = f64::from(die_x) * calibration.die_size_x;
            let y = f64::from(die_y) * calibration.die_size_y;
            let dz = self.height_at(x, y);
            if !dz.is_finite() {
                return Err(DaqError::InvalidInput(format!(
                    "Height model is not finite at die ({die_x}, {die_y})"
                )));
            }
            if table.insert(die_x, die_y, dz).is_some() {
                return Err(DaqError::InvalidInput(format!(
                    "Die ({die_x}, {die_y}) listed twice"
                )));
            }
        }
        Ok(table)
    }

    /// All dies in the square `[-radius, radius]²` whose centre lies within `radius` die pitches.
    pub fn dies_within(radius: i32) -> Vec<(i32, i32)> {
        let r2 = i64::from(radius) * i64::from(radius);
        let mut dies = Vec::new();
        for y in -radius..=radius {
            for x in -radius..=radius {
                if i64::from(x) * i64::from(x) + i64::from(y) * i64::from(y) <= r2 {
                    dies.push((x, y));
                }
            }
        }
        dies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_model_is_zero_everywhere() {
        let model = HeightModel::default();
        assert_eq!(model.height_at(1000.0, -2500.0), 0.0);
    }

    #[test]
    fn test_tilt_terms() {
        let model = HeightModel {
            a: 0.001,
            b: -0.002,
            ..HeightModel::default()
        };
        let h = model.height_at(10000.0, 5000.0);
        assert!((h - (10.0 - 10.0)).abs() < 1e-9);
    }

    #[test]
    fn test_four_fold_term_on_axes() {
        // On the y axis θ = 0, so cos 4θ = 1; at 45° cos 4θ = -1.
        let model = HeightModel {
            c1: 1e-6,
            d0: 1.0,
            d1: 0.5,
            ..HeightModel::default()
        };
        let on_axis = model.height_at(0.0, 1000.0);
        assert!((on_axis - 1.5).abs() < 1e-9);

        let s = 1000.0 / 2f64.sqrt();
        let diagonal = model.height_at(s, s);
        assert!((diagonal - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sample_table_uses_die_pitch() {
        let model = HeightModel {
            a: 0.001,
            ..HeightModel::default()
        };
        let cal = WaferCalibration::with_die_size(20000.0, 30000.0);
        let table = model.sample_table(&[(0, 0), (2, 1)], &cal).unwrap();
        assert_eq!(table.get(0, 0), Some(0.0));
        assert!((table.get(2, 1).unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_table_rejects_repeated_die() {
        let cal = WaferCalibration::default();
        assert!(HeightModel::default()
            .sample_table(&[(1, 1), (1, 1)], &cal)
            .is_err());
    }

    #[test]
    fn test_dies_within_radius() {
        let dies = HeightModel::dies_within(1);
        assert_eq!(dies.len(), 5);
        assert!(dies.contains(&(0, 0)));
        assert!(!dies.contains(&(1, 1)));
    }
}
