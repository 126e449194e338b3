//! Wafer geometry: calibration, coordinate stepping and height modelling.

pub mod calibration;
pub mod height_model;
pub mod stepper;

pub use calibration::{HeightOffset, HeightOffsetTable, WaferCalibration};
pub use height_model::HeightModel;
pub use stepper::{
    compute_position, lookup_height_offset, Position, StageDelta, WaferPositionStepper,
    DEFAULT_HEIGHT_OFFSET,
};
