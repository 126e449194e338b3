//! Wafer geometry and height compensation table.
//!
//! Calibration files are TOML or JSON, keyed by integer die coordinates:
//!
//! ```toml
//! die_size_x = 24425.0
//! die_size_y = 28000.0
//!
//! [[height_offsets]]
//! x = 2
//! y = 0
//! dz = -20.0
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One measured chuck height correction for a die.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightOffset {
    /// Die column index
    #[serde(alias = "die_x")]
    pub x: i32,
    /// Die row index
    #[serde(alias = "die_y")]
    pub y: i32,
    /// Height correction in µm
    pub dz: f64,
}

/// Height corrections keyed by `(die_x, die_y)`. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<HeightOffset>", into = "Vec<HeightOffset>")]
pub struct HeightOffsetTable {
    offsets: BTreeMap<(i32, i32), f64>,
}

impl HeightOffsetTable {
    /// Empty table; every lookup falls back to the default height.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, rejecting duplicate die keys and non-finite offsets.
    pub fn from_entries<I>(entries: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = HeightOffset>,
    {
        let mut table = Self::new();
        for entry in entries {
            if !entry.dz.is_finite() {
                return Err(DaqError::InvalidInput(format!(
                    "Height offset for die ({}, {}) is not finite: {}",
                    entry.x, entry.y, entry.dz
                )));
            }
            if table.offsets.insert((entry.x, entry.y), entry.dz).is_some() {
                return Err(DaqError::InvalidInput(format!(
                    "Duplicate height offset for die ({}, {})",
                    entry.x, entry.y
                )));
            }
        }
        Ok(table)
    }

    /// Insert or replace the offset for a die, returning the previous value.
    pub fn insert(&mut self, die_x: i32, die_y: i32, dz: f64) -> Option<f64> {
        self.offsets.insert((die_x, die_y), dz)
    }

    /// Exact-key lookup.
    pub fn get(&self, die_x: i32, die_y: i32) -> Option<f64> {
        self.offsets.get(&(die_x, die_y)).copied()
    }

    /// Number of tabulated dies.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True when no die is tabulated.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Entries in `(die_x, die_y)` order.
    pub fn entries(&self) -> impl Iterator<Item = HeightOffset> + '_ {
        self.offsets
            .iter()
            .map(|(&(x, y), &dz)| HeightOffset { x, y, dz })
    }
}

impl TryFrom<Vec<HeightOffset>> for HeightOffsetTable {
    type Error = DaqError;

    fn try_from(entries: Vec<HeightOffset>) -> Result<Self, Self::Error> {
        Self::from_entries(entries)
    }
}

impl From<HeightOffsetTable> for Vec<HeightOffset> {
    fn from(table: HeightOffsetTable) -> Self {
        table.entries().collect()
    }
}

/// Die geometry plus the chuck height compensation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaferCalibration {
    /// Die pitch along x in µm
    pub die_size_x: f64,
    /// Die pitch along y in µm
    pub die_size_y: f64,
    /// Stage x of die (0, 0), device (0, 0)
    #[serde(default)]
    pub die_offset_x: f64,
    /// Stage y of die (0, 0), device (0, 0)
    #[serde(default)]
    pub die_offset_y: f64,
    /// Device pitch inside a die along x in µm
    #[serde(default)]
    pub device_pitch_x: f64,
    /// Device pitch inside a die along y in µm
    #[serde(default)]
    pub device_pitch_y: f64,
    /// Per-die chuck height corrections
    #[serde(default, rename = "height_offsets")]
    pub height_offset_table: HeightOffsetTable,
}

impl Default for WaferCalibration {
    fn default() -> Self {
        Self {
            die_size_x: 10000.0,
            die_size_y: 10000.0,
            die_offset_x: 0.0,
            die_offset_y: 0.0,
            device_pitch_x: 0.0,
            device_pitch_y: 0.0,
            height_offset_table: HeightOffsetTable::new(),
        }
    }
}

impl WaferCalibration {
    /// Geometry only, no height corrections.
    pub fn with_die_size(die_size_x: f64, die_size_y: f64) -> Self {
        Self {
            die_size_x,
            die_size_y,
            ..Self::default()
        }
    }

    /// Set the device pitch used for row/column addressing inside a die.
    pub fn with_device_pitch(mut self, device_pitch_x: f64, device_pitch_y: f64) -> Self {
        self.device_pitch_x = device_pitch_x;
        self.device_pitch_y = device_pitch_y;
        self
    }

    /// Set the stage offset of die (0, 0).
    pub fn with_die_offset(mut self, die_offset_x: f64, die_offset_y: f64) -> Self {
        self.die_offset_x = die_offset_x;
        self.die_offset_y = die_offset_y;
        self
    }

    /// Replace the height compensation table.
    pub fn with_height_offsets(mut self, table: HeightOffsetTable) -> Self {
        self.height_offset_table = table;
        self
    }

    /// Load a calibration file; the format follows the extension (`.toml` or `.json`).
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let calibration: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("toml") => toml::from_str(&text).map_err(|e| {
                DaqError::Configuration(format!(
                    "Invalid calibration file {}: {e}",
                    path.display()
                ))
            })?,
            other => {
                return Err(DaqError::Configuration(format!(
                    "Unsupported calibration file extension {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Geometry values must be finite and die sizes positive.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.die_size_x.is_finite() && self.die_size_x > 0.0)
            || !(self.die_size_y.is_finite() && self.die_size_y > 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "Die size must be positive, got ({}, {})",
                self.die_size_x, self.die_size_y
            )));
        }
        let others = [
            self.die_offset_x,
            self.die_offset_y,
            self.device_pitch_x,
            self.device_pitch_y,
        ];
        if others.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::Configuration(
                "Die offsets and device pitch must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
