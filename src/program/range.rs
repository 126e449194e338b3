//! Sweep value ranges and sweep direction patterns.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Upper bound on generated points; guards against `step` typos like `1e-9`.
pub const MAX_SWEEP_POINTS: usize = 10_001;

/// A list of explicit values, a single value, or an inclusive linear range.
///
/// Accepted JSON/TOML forms:
/// - `[0.0, 0.5, 1.0]`
/// - `0.5`
/// - `{ start = -1.2, stop = 1.2, step = 0.1 }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SweepRange {
    /// Explicit values, used as given
    List(Vec<f64>),
    /// Inclusive `start..=stop` with magnitude `step`
    Linear {
        /// First value
        start: f64,
        /// Last value (included when reachable)
        stop: f64,
        /// Step magnitude; the sign follows `start -> stop`
        step: f64,
    },
    /// One value
    Value(f64),
}

impl SweepRange {
    /// Inclusive linear range.
    pub fn linear(start: f64, stop: f64, step: f64) -> Self {
        SweepRange::Linear { start, stop, step }
    }

    /// Expand into the concrete point list.
    pub fn values(&self) -> AppResult<Vec<f64>> {
        let values = match self {
            SweepRange::List(values) => values.clone(),
            SweepRange::Value(v) => vec![*v],
            SweepRange::Linear { start, stop, step } => linear_values(*start, *stop, *step)?,
        };
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::InvalidInput(format!(
                "Sweep values must be finite: {values:?}"
            )));
        }
        Ok(values)
    }
}

fn linear_values(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if !start.is_finite() || !stop.is_finite() || !step.is_finite() {
        return Err(DaqError::InvalidInput(format!(
            "Sweep range must be finite: start={start}, stop={stop}, step={step}"
        )));
    }
    if step == 0.0 {
        if start == stop {
            return Ok(vec![start]);
        }
        return Err(DaqError::InvalidInput(
            "Sweep step must be non-zero".to_string(),
        ));
    }

    let span = stop - start;
    let step = step.abs().copysign(span);
    // Tolerance keeps `stop` when `span / step` lands just under an integer.
    let intervals = (span / step + 1e-9).floor();
    let count = intervals as usize + 1;
    if count > MAX_SWEEP_POINTS {
        return Err(DaqError::InvalidInput(format!(
            "Sweep has {count} points, limit is {MAX_SWEEP_POINTS}"
        )));
    }

    Ok((0..count)
        .map(|i| round_volts(start + step * i as f64))
        .collect())
}

/// Round to 1 nV to drop accumulated float noise (0.30000000000000004 -> 0.3).
fn round_volts(v: f64) -> f64 {
    (v * 1e9).round() / 1e9 + 0.0
}

/// Direction of one staircase sweep (single or double stair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepDirection {
    /// `start -> stop`
    Forward,
    /// `stop -> start`
    Reverse,
    /// `start -> stop -> start`
    ForwardReverse,
    /// `stop -> start -> stop`
    ReverseForward,
}

impl SweepDirection {
    /// Number of recorded direction slots this sweep fills.
    pub fn num_sweeps(self) -> usize {
        match self {
            SweepDirection::Forward | SweepDirection::Reverse => 1,
            SweepDirection::ForwardReverse | SweepDirection::ReverseForward => 2,
        }
    }

    /// Point lists for each recorded direction of this sweep.
    pub fn apply(self, values: &[f64]) -> Vec<Vec<f64>> {
        let forward = values.to_vec();
        let reverse: Vec<f64> = values.iter().rev().copied().collect();
        match self {
            SweepDirection::Forward => vec![forward],
            SweepDirection::Reverse => vec![reverse],
            SweepDirection::ForwardReverse => vec![forward, reverse],
            SweepDirection::ReverseForward => vec![reverse, forward],
        }
    }

    /// Parse a pattern like `"frf"` into sweeps.
    ///
    /// Two characters are matched at a time: `fr`/`rf` become double-stair sweeps,
    /// `ff`/`rr` emit a single sweep and advance one character, and a trailing
    /// `f`/`r` is a single sweep.
    pub fn parse_pattern(pattern: &str) -> AppResult<Vec<SweepDirection>> {
        let chars: Vec<char> = pattern.trim().to_ascii_lowercase().chars().collect();
        if chars.is_empty() {
            return Err(DaqError::InvalidInput(
                "Empty sweep direction pattern".to_string(),
            ));
        }

        let mut sweeps = Vec::new();
        let mut idx = 0;
        while idx < chars.len() {
            if idx + 1 < chars.len() {
                match (chars[idx], chars[idx + 1]) {
                    ('f', 'f') => {
                        sweeps.push(SweepDirection::Forward);
                        idx += 1;
                    }
                    ('r', 'r') => {
                        sweeps.push(SweepDirection::Reverse);
                        idx += 1;
                    }
                    ('f', 'r') => {
                        sweeps.push(SweepDirection::ForwardReverse);
                        idx += 2;
                    }
                    ('r', 'f') => {
                        sweeps.push(SweepDirection::ReverseForward);
                        idx += 2;
                    }
                    (a, b) => {
                        return Err(DaqError::InvalidInput(format!(
                            "Invalid sweep direction pattern '{a}{b}' in '{pattern}'"
                        )))
                    }
                }
            } else {
                match chars[idx] {
                    'f' => sweeps.push(SweepDirection::Forward),
                    'r' => sweeps.push(SweepDirection::Reverse),
                    c => {
                        return Err(DaqError::InvalidInput(format!(
                            "Invalid sweep direction '{c}' in '{pattern}'"
                        )))
                    }
                }
                idx += 1;
            }
        }
        Ok(sweeps)
    }

    /// Total direction slots, counting double-stair sweeps twice.
    pub fn count_total(sweeps: &[SweepDirection]) -> usize {
        sweeps.iter().map(|s| s.num_sweeps()).sum()
    }
}
