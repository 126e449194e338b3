//! Logical wafer addresses to physical stage coordinates.

use super::calibration::{HeightOffsetTable, WaferCalibration};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Height used for dies missing from the compensation table.
pub const DEFAULT_HEIGHT_OFFSET: f64 = 0.0;

/// Resolved stage coordinate of one device. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Stage x in µm
    pub x: f64,
    /// Stage y in µm
    pub y: f64,
    /// Chuck height correction in µm
    pub z: f64,
    /// Die column
    pub die_x: i32,
    /// Die row
    pub die_y: i32,
    /// Device row inside the die
    pub device_row: i32,
    /// Device column inside the die
    pub device_col: i32,
}

impl Position {
    /// True when both positions sit on the same die.
    pub fn same_die(&self, other: &Position) -> bool {
        self.die_x == other.die_x && self.die_y == other.die_y
    }
}

/// Relative chuck move, already expressed in the stage frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDelta {
    /// x move in µm
    pub dx: f64,
    /// y move in µm
    pub dy: f64,
    /// z move in µm
    pub dz: f64,
}

impl StageDelta {
    /// No motion on any axis.
    pub fn is_zero(&self) -> bool {
        self.dx == 0.0 && self.dy == 0.0 && self.dz == 0.0
    }
}

/// Exact-key lookup; untabulated dies get [`DEFAULT_HEIGHT_OFFSET`].
pub fn lookup_height_offset(die_x: i32, die_y: i32, table: &HeightOffsetTable) -> f64 {
    table.get(die_x, die_y).unwrap_or(DEFAULT_HEIGHT_OFFSET)
}

/// Map a logical `(die, device)` address to a stage coordinate.
///
/// Pure and deterministic: the same inputs always give the same `Position`.
pub fn compute_position(
    die_x: i32,
    die_y: i32,
    device_row: i32,
    device_col: i32,
    calibration: &WaferCalibration,
) -> Position {
    let x = f64::from(die_x) * calibration.die_size_x
        + f64::from(device_col) * calibration.device_pitch_x
        + calibration.die_offset_x;
    let y = f64::from(die_y) * calibration.die_size_y
        + f64::from(device_row) * calibration.device_pitch_y
        + calibration.die_offset_y;
    let z = lookup_height_offset(die_x, die_y, &calibration.height_offset_table);

    Position {
        x,
        y,
        z,
        die_x,
        die_y,
        device_row,
        device_col,
    }
}

/// Calibration plus the stage frame convention.
#[derive(Debug, Clone)]
pub struct WaferPositionStepper {
    calibration: WaferCalibration,
    invert_direction: bool,
}

impl WaferPositionStepper {
    /// With `invert_direction`, the wafer's top-left maps to `(+x, +y)` on the stage.
    pub fn new(calibration: WaferCalibration, invert_direction: bool) -> Self {
        Self {
            calibration,
            invert_direction,
        }
    }

    /// Active calibration.
    pub fn calibration(&self) -> &WaferCalibration {
        &self.calibration
    }

    /// Whether x/y moves are mirrored before reaching the stage.
    pub fn invert_direction(&self) -> bool {
        self.invert_direction
    }

    /// [`compute_position`] with this stepper's calibration.
    pub fn position(&self, die_x: i32, die_y: i32, device_row: i32, device_col: i32) -> Position {
        compute_position(die_x, die_y, device_row, device_col, &self.calibration)
    }

    /// Validate a manual jog and convert it to the stage frame.
    pub fn move_relative(&self, dx: f64, dy: f64) -> AppResult<StageDelta> {
        if !dx.is_finite() || !dy.is_finite() {
            return Err(DaqError::InvalidInput(format!(
                "Chuck move must be finite, got dx={dx}, dy={dy}"
            )));
        }
        Ok(self.to_stage_frame(dx, dy, 0.0))
    }

    /// Relative move from one resolved position to another, height included.
    pub fn delta_between(&self, from: &Position, to: &Position) -> StageDelta {
        self.to_stage_frame(to.x - from.x, to.y - from.y, to.z - from.z)
    }

    fn to_stage_frame(&self, dx: f64, dy: f64, dz: f64) -> StageDelta {
        let sign = if self.invert_direction { -1.0 } else { 1.0 };
        // Adding 0.0 folds -0.0 into 0.0 so zero moves stay zero after inversion.
        StageDelta {
            dx: sign * dx + 0.0,
            dy: sign * dy + 0.0,
            dz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wafer::calibration::HeightOffset;

    fn calibration() -> WaferCalibration {
        let table = HeightOffsetTable::from_entries([HeightOffset {
            x: 2,
            y: 0,
            dz: -20.0,
        }])
        .unwrap();
        WaferCalibration::with_die_size(24425.0, 28000.0).with_height_offsets(table)
    }

    #[test]
    fn test_tabulated_die_height() {
        let pos = compute_position(2, 0, 0, 0, &calibration());
        assert_eq!(pos.z, -20.0);
        assert_eq!(pos.x, 2.0 * 24425.0);
        assert_eq!(pos.y, 0.0);
    }

    #[test]
    fn test_untabulated_die_defaults_to_zero() {
        let pos = compute_position(5, -3, 0, 0, &calibration());
        assert_eq!(pos.z, DEFAULT_HEIGHT_OFFSET);
        assert_eq!(lookup_height_offset(5, -3, &HeightOffsetTable::new()), 0.0);
    }

    #[test]
    fn test_compute_position_is_deterministic() {
        let cal = calibration()
            .with_device_pitch(150.0, 200.0)
            .with_die_offset(10.0, -5.0);
        let a = compute_position(-1, 3, 2, 4, &cal);
        let b = compute_position(-1, 3, 2, 4, &cal);
        assert_eq!(a, b);
        assert_eq!(a.x, -24425.0 + 4.0 * 150.0 + 10.0);
        assert_eq!(a.y, 3.0 * 28000.0 + 2.0 * 200.0 - 5.0);
    }

    #[test]
    fn test_move_relative_rejects_non_finite() {
        let stepper = WaferPositionStepper::new(calibration(), false);
        assert!(matches!(
            stepper.move_relative(f64::NAN, 1.0),
            Err(DaqError::InvalidInput(_))
        ));
        assert!(stepper.move_relative(1.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_move_relative_inverted_frame() {
        let stepper = WaferPositionStepper::new(calibration(), true);
        let delta = stepper.move_relative(100.0, -50.0).unwrap();
        assert_eq!(delta, StageDelta { dx: -100.0, dy: 50.0, dz: 0.0 });

        let plain = WaferPositionStepper::new(calibration(), false);
        let delta = plain.move_relative(100.0, -50.0).unwrap();
        assert_eq!(delta, StageDelta { dx: 100.0, dy: -50.0, dz: 0.0 });
    }

    #[test]
    fn test_delta_between_dies_includes_height() {
        let stepper = WaferPositionStepper::new(calibration(), false);
        let from = stepper.position(1, 0, 0, 0);
        let to = stepper.position(2, 0, 0, 0);
        let delta = stepper.delta_between(&from, &to);
        assert_eq!(delta.dx, 24425.0);
        assert_eq!(delta.dy, 0.0);
        assert_eq!(delta.dz, -20.0);
        assert!(!from.same_die(&to));
    }

    #[test]
    fn test_zero_delta_stays_zero_when_inverted() {
        let stepper = WaferPositionStepper::new(calibration(), true);
        let p = stepper.position(0, 0, 1, 1);
        assert!(stepper.delta_between(&p, &p).is_zero());
    }
}
