use super::{ArraySweepConfig, ListSweepConfig, SweepOrder};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Most devices a single run may visit.
pub const MAX_SWEEP_TARGETS: usize = 100_000;

/// Logical address the user starts a run from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAddress {
    /// Current die column
    pub die_x: i32,
    /// Current die row
    pub die_y: i32,
    /// Starting device row
    pub device_row: i32,
    /// Starting device column
    pub device_col: i32,
}

/// One device a run measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Position in the run's target order
    pub index: usize,
    /// Label used in the save directory, e.g. `r0_c1` or a module name
    pub label: String,
    /// Die column
    pub die_x: i32,
    /// Die row
    pub die_y: i32,
    /// Device row
    pub device_row: i32,
    /// Device column
    pub device_col: i32,
    /// Extra x offset in µm on top of the device position
    #[serde(default)]
    pub offset_x: f64,
    /// Extra y offset in µm on top of the device position
    #[serde(default)]
    pub offset_y: f64,
}

pub(super) fn single(start: &StartAddress) -> Vec<Target> {
    vec![Target {
        index: 0,
        label: format!("r{}_c{}", start.device_row, start.device_col),
        die_x: start.die_x,
        die_y: start.die_y,
        device_row: start.device_row,
        device_col: start.device_col,
        offset_x: 0.0,
        offset_y: 0.0,
    }]
}

fn dies_or_start(dies: &[[i32; 2]], start: &StartAddress) -> Vec<(i32, i32)> {
    if dies.is_empty() {
        vec![(start.die_x, start.die_y)]
    } else {
        dies.iter().map(|&[x, y]| (x, y)).collect()
    }
}

fn check_target_count(sweep: &str, count: Option<usize>) -> AppResult<usize> {
    match count {
        Some(n) if n <= MAX_SWEEP_TARGETS => Ok(n),
        _ => Err(DaqError::InvalidInput(format!(
            "{sweep} sweep exceeds the limit of {MAX_SWEEP_TARGETS} targets"
        ))),
    }
}

/// `count` consecutive indices from `first`, if they fit in `i32`.
fn index_range(axis: &str, first: i32, count: u32) -> AppResult<Range<i32>> {
    i32::try_from(count)
        .ok()
        .and_then(|n| first.checked_add(n))
        .map(|end| first..end)
        .ok_or_else(|| {
            DaqError::InvalidInput(format!(
                "Array sweep {axis} range {first} + {count} is out of bounds"
            ))
        })
}

/// Labels become directory names, so they must be a single path component.
fn check_label(name: &str) -> AppResult<()> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\'])
    {
        return Err(DaqError::InvalidInput(format!(
            "Module name '{name}' is not a valid directory name"
        )));
    }
    Ok(())
}

pub(super) fn array(start: &StartAddress, cfg: &ArraySweepConfig) -> AppResult<Vec<Target>> {
    if cfg.num_rows == 0 || cfg.num_cols == 0 {
        return Err(DaqError::InvalidInput(format!(
            "Array sweep needs at least one row and column, got {}x{}",
            cfg.num_rows, cfg.num_cols
        )));
    }
    let dies = dies_or_start(&cfg.dies, start);
    let count = check_target_count(
        "Array",
        (cfg.num_rows as usize)
            .checked_mul(cfg.num_cols as usize)
            .and_then(|n| n.checked_mul(dies.len())),
    )?;
    let row_range = index_range("row", start.device_row, cfg.num_rows)?;
    let col_range = index_range("column", start.device_col, cfg.num_cols)?;
    let rows = || row_range.clone();
    let cols = || col_range.clone();

    let mut targets = Vec::with_capacity(count);
    for (die_x, die_y) in dies {
        let mut push = |row: i32, col: i32, label: String| {
            targets.push(Target {
                index: targets.len(),
                label,
                die_x,
                die_y,
                device_row: row,
                device_col: col,
                offset_x: 0.0,
                offset_y: 0.0,
            })
        };
        match cfg.sweep_order {
            SweepOrder::Row => {
                for row in rows() {
                    for col in cols() {
                        push(row, col, format!("r{row}_c{col}"));
                    }
                }
            }
            SweepOrder::Col => {
                for col in cols() {
                    for row in rows() {
                        push(row, col, format!("c{col}_r{row}"));
                    }
                }
            }
        }
    }
    Ok(targets)
}

pub(super) fn list(start: &StartAddress, cfg: &ListSweepConfig) -> AppResult<Vec<Target>> {
    let dies = dies_or_start(&cfg.dies, start);
    let count = check_target_count("List", cfg.order.len().checked_mul(dies.len()))?;
    let mut targets = Vec::with_capacity(count);
    for (die_x, die_y) in dies {
        for name in &cfg.order {
            let module = cfg.modules.get(name).ok_or_else(|| {
                DaqError::InvalidInput(format!("Unknown module '{name}' in list sweep"))
            })?;
            check_label(name)?;
            if !module.x.is_finite() || !module.y.is_finite() {
                return Err(DaqError::InvalidInput(format!(
                    "Module '{name}' position must be finite"
                )));
            }
            targets.push(Target {
                index: targets.len(),
                label: name.clone(),
                die_x,
                die_y,
                device_row: start.device_row,
                device_col: start.device_col,
                offset_x: module.x,
                offset_y: module.y,
            });
        }
    }
    Ok(targets)
}
