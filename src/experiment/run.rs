//! Run-scoped state: the immutable run request and per-target metadata.

use crate::program::ProgramConfig;
use crate::sweep::{StartAddress, SweepKind, SweepSpec, Target};
use crate::wafer::{Position, WaferCalibration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Timestamp format used in save directory names.
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Format a UTC time for save paths.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Everything a run needs, captured when the run is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRun {
    /// Run identity
    pub id: Uuid,
    /// Request time
    pub started_at: DateTime<Utc>,
    /// Requesting user
    pub user: String,
    /// Die and device the run starts from
    pub start: StartAddress,
    /// Geometry and height table snapshot
    pub calibration: WaferCalibration,
    /// Stage frame convention
    pub invert_direction: bool,
    /// Program chain, executed in order at every target
    pub programs: Vec<ProgramConfig>,
    /// Sweep strategy
    pub sweep: SweepSpec,
    /// Root folder for saved results
    pub data_folder: PathBuf,
    /// Persist datasets
    pub save_data: bool,
    /// Render plots of datasets (handled by an external renderer)
    pub save_image: bool,
}

impl MeasurementRun {
    /// New run with a fresh id; saving disabled.
    pub fn new(
        user: impl Into<String>,
        start: StartAddress,
        calibration: WaferCalibration,
        programs: Vec<ProgramConfig>,
        sweep: SweepSpec,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            user: user.into(),
            start,
            calibration,
            invert_direction: true,
            programs,
            sweep,
            data_folder: PathBuf::new(),
            save_data: false,
            save_image: false,
        }
    }

    /// Save datasets under `data_folder`.
    pub fn with_data_folder(mut self, data_folder: impl Into<PathBuf>, save_data: bool) -> Self {
        self.data_folder = data_folder.into();
        self.save_data = save_data;
        self
    }

    /// Request plot images next to the data.
    pub fn with_save_image(mut self, save_image: bool) -> Self {
        self.save_image = save_image;
        self
    }

    /// Set the stage frame convention.
    pub fn with_invert_direction(mut self, invert_direction: bool) -> Self {
        self.invert_direction = invert_direction;
        self
    }

    /// Request time formatted for paths.
    pub fn timestamp(&self) -> String {
        format_timestamp(&self.started_at)
    }
}

/// Save directory of a target, relative to the data folder.
///
/// The target index keeps directories distinct when a sweep visits the same
/// label twice within one second.
pub fn target_save_dir(target: &Target, timestamp: &str) -> PathBuf {
    Path::new(&format!("die_x_{}_y_{}", target.die_x, target.die_y)).join(format!(
        "gax_{:03}_{}_{}",
        target.index, target.label, timestamp
    ))
}

/// Metadata of one target, saved next to its data and attached to progress updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMetadata {
    /// Run identity
    pub run_id: Uuid,
    /// Requesting user
    pub user: String,
    /// Sweep strategy
    pub sweep: SweepKind,
    /// Sweep parameters
    pub sweep_config: serde_json::Value,
    /// The target being measured
    pub target: Target,
    /// Resolved stage position of the target
    pub position: Position,
    /// Run start address
    pub start: StartAddress,
    /// Die pitch along x, µm
    pub die_size_x: f64,
    /// Die pitch along y, µm
    pub die_size_y: f64,
    /// Device pitch along x, µm
    pub device_pitch_x: f64,
    /// Device pitch along y, µm
    pub device_pitch_y: f64,
    /// Root folder for saved results
    pub data_folder: PathBuf,
    /// Target directory relative to `data_folder`
    pub save_dir: PathBuf,
    /// Whether data is persisted
    pub save_data: bool,
    /// Program chain
    pub programs: Vec<ProgramConfig>,
    /// Target start time, `TIMESTAMP_FORMAT`
    pub timestamp: String,
}

impl SweepMetadata {
    /// Metadata for `target` of `run`, stamped now.
    pub fn for_target(run: &MeasurementRun, target: &Target, position: Position) -> Self {
        let timestamp = format_timestamp(&Utc::now());
        Self {
            run_id: run.id,
            user: run.user.clone(),
            sweep: run.sweep.kind,
            sweep_config: run.sweep.config.clone(),
            target: target.clone(),
            position,
            start: run.start,
            die_size_x: run.calibration.die_size_x,
            die_size_y: run.calibration.die_size_y,
            device_pitch_x: run.calibration.device_pitch_x,
            device_pitch_y: run.calibration.device_pitch_y,
            data_folder: run.data_folder.clone(),
            save_dir: target_save_dir(target, &timestamp),
            save_data: run.save_data,
            programs: run.programs.clone(),
            timestamp,
        }
    }

    /// Absolute directory of this target's files.
    pub fn output_dir(&self) -> PathBuf {
        self.data_folder.join(&self.save_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(format_timestamp(&t), "2024_03_07_09_05_01");
    }

    #[test]
    fn test_target_save_dir() {
        let target = Target {
            index: 0,
            label: "r1_c2".into(),
            die_x: -1,
            die_y: 3,
            device_row: 1,
            device_col: 2,
            offset_x: 0.0,
            offset_y: 0.0,
        };
        let dir = target_save_dir(&target, "2024_03_07_09_05_01");
        assert_eq!(
            dir,
            Path::new("die_x_-1_y_3").join("gax_000_r1_c2_2024_03_07_09_05_01")
        );

        let repeat = Target {
            index: 1,
            ..target
        };
        assert_ne!(target_save_dir(&repeat, "2024_03_07_09_05_01"), dir);
    }

    #[test]
    fn test_new_run_does_not_save() {
        let run = MeasurementRun::new(
            "public",
            StartAddress::default(),
            WaferCalibration::default(),
            vec![ProgramConfig::new("debug", serde_json::json!({}))],
            SweepSpec::single(),
        );
        assert!(!run.save_data);
        assert_eq!(run.timestamp().len(), "2024_03_07_09_05_01".len());
    }
}
