//! Ragged per-step results to a padded, rectangular dataset.
//!
//! Steps of one program rarely agree on length: a form sweep to 2.5 V has more
//! points than a set sweep to 2.0 V. The buffer keeps every step as
//! `(values, true_length)` and only pads when a [`ResultDataset`] snapshot is taken:
//!
//! ```text
//!            true_length   padded to num_points_max = 5
//! form       5             [0.0, 0.1, 0.2, 0.3, 0.4]
//! reset      4             [0.0, -0.1, -0.2, -0.3, NaN]
//! set        3             [0.0, 0.1, 0.2, NaN, NaN]
//! ```
//!
//! Entries at index `>= num_points[i]` are always NaN and never real data. Pushing a
//! longer step later widens every row but never changes an earlier `num_points`.

use crate::program::SweepStep;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// `(units, directions, points)` array of one channel.
pub type Array3 = Vec<Vec<Vec<f64>>>;

#[derive(Debug, Clone)]
struct Unit {
    name: String,
    channels: BTreeMap<String, Vec<Vec<f64>>>,
    true_length: usize,
    num_directions: usize,
}

/// Accumulates the steps of one program run at one target.
#[derive(Debug, Clone)]
pub struct SweepResultBuffer {
    program: String,
    channels: BTreeSet<String>,
    units: Vec<Unit>,
}

impl SweepResultBuffer {
    /// Empty buffer; `channels` are always present in snapshots, even if no step reports them.
    pub fn new(program: impl Into<String>, channels: &[&str]) -> Self {
        Self {
            program: program.into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            units: Vec::new(),
        }
    }

    /// Append one completed step, returning its unit index.
    pub fn push(&mut self, step: SweepStep) -> usize {
        let true_length = step.num_points();
        let num_directions = step.num_directions();
        self.channels.extend(step.channels.keys().cloned());
        self.units.push(Unit {
            name: step.name,
            channels: step.channels,
            true_length,
            num_directions,
        });
        self.units.len() - 1
    }

    /// Program tag.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Units recorded so far.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True before the first push.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// True length of every unit.
    pub fn num_points(&self) -> Vec<usize> {
        self.units.iter().map(|u| u.true_length).collect()
    }

    /// Padded width.
    pub fn num_points_max(&self) -> usize {
        self.units.iter().map(|u| u.true_length).max().unwrap_or(0)
    }

    /// Padded direction count.
    pub fn num_directions_max(&self) -> usize {
        self.units
            .iter()
            .map(|u| u.num_directions)
            .max()
            .unwrap_or(0)
    }

    /// Padded dataset of every unit recorded so far, plus derived channels.
    pub fn snapshot(&self) -> ResultDataset {
        let width = self.num_points_max();
        let dirs = self.num_directions_max();

        let mut data = BTreeMap::new();
        for channel in &self.channels {
            let array: Array3 = self
                .units
                .iter()
                .map(|unit| pad_unit(unit.channels.get(channel), dirs, width))
                .collect();
            data.insert(channel.clone(), array);
        }
        add_derived_channels(&mut data);

        ResultDataset {
            program: self.program.clone(),
            step: self.units.len(),
            num_points: self.num_points(),
            num_points_max: width,
            num_directions: dirs,
            step_names: self.units.iter().map(|u| u.name.clone()).collect(),
            data,
        }
    }
}

fn pad_unit(directions: Option<&Vec<Vec<f64>>>, dirs: usize, width: usize) -> Vec<Vec<f64>> {
    (0..dirs)
        .map(|d| {
            let mut row = vec![f64::NAN; width];
            if let Some(values) = directions.and_then(|all| all.get(d)) {
                let n = values.len().min(width);
                row[..n].copy_from_slice(&values[..n]);
            }
            row
        })
        .collect()
}

/// `|i_*|` for every current channel and `res = |v_d / i_d|`.
fn add_derived_channels(data: &mut BTreeMap<String, Array3>) {
    let currents: Vec<String> = data
        .keys()
        .filter(|k| k.starts_with("i_") && !k.ends_with("_abs"))
        .cloned()
        .collect();
    for name in currents {
        if let Some(array) = data.get(&name) {
            let abs = map3(array, f64::abs);
            data.insert(format!("{name}_abs"), abs);
        }
    }

    if let (Some(v_d), Some(i_d)) = (data.get("v_d"), data.get("i_d")) {
        let res = zip3(v_d, i_d, |v, i| (v / i).abs());
        data.insert("res".to_string(), res);
    }
}

fn map3(array: &Array3, f: impl Fn(f64) -> f64) -> Array3 {
    array
        .iter()
        .map(|dirs| dirs.iter().map(|row| row.iter().map(|&x| f(x)).collect()).collect())
        .collect()
}

fn zip3(a: &Array3, b: &Array3, f: impl Fn(f64, f64) -> f64) -> Array3 {
    a.iter()
        .zip(b)
        .map(|(da, db)| {
            da.iter()
                .zip(db)
                .map(|(ra, rb)| ra.iter().zip(rb).map(|(&x, &y)| f(x, y)).collect())
                .collect()
        })
        .collect()
}

/// Padded dataset of a program at one target.
///
/// Every array in `data` is shaped `(step, num_directions, num_points_max)`.
/// NaN padding serializes as JSON `null` and reads back as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDataset {
    /// Program tag
    pub program: String,
    /// Units recorded
    pub step: usize,
    /// True length of each unit
    pub num_points: Vec<usize>,
    /// Padded width
    pub num_points_max: usize,
    /// Padded direction count
    pub num_directions: usize,
    /// Name of each unit
    pub step_names: Vec<String>,
    /// Channel arrays
    #[serde(deserialize_with = "deserialize_nullable_arrays")]
    pub data: BTreeMap<String, Array3>,
}

impl ResultDataset {
    /// `(units, directions, points)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.step, self.num_directions, self.num_points_max)
    }

    /// Channel array by name.
    pub fn channel(&self, name: &str) -> Option<&Array3> {
        self.data.get(name)
    }
}

fn deserialize_nullable_arrays<'de, D>(deserializer: D) -> Result<BTreeMap<String, Array3>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Vec<Vec<Vec<Option<f64>>>>> = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, units)| {
            let array = units
                .into_iter()
                .map(|dirs| {
                    dirs.into_iter()
                        .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
                        .collect()
                })
                .collect();
            (name, array)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::rram::RRAM_CHANNELS;

    fn ramp(n: usize, scale: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * scale).collect()
    }

    fn step(name: &str, n: usize) -> SweepStep {
        let fwd = ramp(n, 0.1);
        let rev: Vec<f64> = fwd.iter().rev().copied().collect();
        let i_fwd: Vec<f64> = fwd.iter().map(|v| -1e-6 * (v + 1.0)).collect();
        let i_rev: Vec<f64> = rev.iter().map(|v| -1e-6 * (v + 1.0)).collect();
        SweepStep::new(name)
            .with_channel("v_d", vec![fwd, rev])
            .with_channel("i_d", vec![i_fwd, i_rev])
    }

    #[test]
    fn test_ragged_six_steps() {
        let mut buffer = SweepResultBuffer::new("keysight_rram_1t1r", RRAM_CHANNELS);
        let names = ["form", "reset", "set", "reset", "set", "reset"];
        for (name, n) in names.iter().zip([5, 4, 3, 4, 3, 4]) {
            buffer.push(step(name, n));
        }

        let ds = buffer.snapshot();
        assert_eq!(ds.shape(), (6, 2, 5));
        assert_eq!(ds.num_points, vec![5, 4, 3, 4, 3, 4]);
        assert_eq!(ds.step_names, names);

        let v_d = ds.channel("v_d").unwrap();
        for (unit, &n) in ds.num_points.iter().enumerate() {
            for dir in &v_d[unit] {
                assert_eq!(dir.len(), 5);
                assert!(dir[..n].iter().all(|x| !x.is_nan()));
                assert!(dir[n..].iter().all(|x| x.is_nan()));
            }
        }
        // Channels declared by the shape but never reported are all-NaN.
        let v_g = ds.channel("v_g").unwrap();
        assert!(v_g.iter().flatten().flatten().all(|x| x.is_nan()));
    }

    #[test]
    fn test_incremental_snapshot_widens_only() {
        let mut buffer = SweepResultBuffer::new("debug", &[]);
        buffer.push(step("a", 3));
        buffer.push(step("b", 2));

        let early = buffer.snapshot();
        assert_eq!(early.step, 2);
        assert_eq!(early.shape(), (2, 2, 3));

        buffer.push(step("c", 6));
        let late = buffer.snapshot();
        assert_eq!(late.shape(), (3, 2, 6));
        assert_eq!(&late.num_points[..2], &early.num_points[..]);
        assert_eq!(late.channel("v_d").unwrap()[0][0][..3], early.channel("v_d").unwrap()[0][0][..]);
    }

    #[test]
    fn test_empty_step_pads() {
        let mut buffer = SweepResultBuffer::new("debug", &["v_gs"]);
        buffer.push(step("a", 2));
        buffer.push(SweepStep::new("aborted"));

        let ds = buffer.snapshot();
        assert_eq!(ds.num_points, vec![2, 0]);
        assert!(ds.channel("v_d").unwrap()[1]
            .iter()
            .flatten()
            .all(|x| x.is_nan()));
    }

    #[test]
    fn test_direction_axis_padded() {
        let mut buffer = SweepResultBuffer::new("debug", &[]);
        buffer.push(SweepStep::new("one").with_channel("v_gs", vec![vec![1.0, 2.0]]));
        buffer.push(step("two", 2));

        let ds = buffer.snapshot();
        assert_eq!(ds.num_directions, 2);
        let v_gs = ds.channel("v_gs").unwrap();
        assert_eq!(v_gs[0][0], vec![1.0, 2.0]);
        assert!(v_gs[0][1].iter().all(|x| x.is_nan()));
    }

    #[test]
    fn test_derived_channels() {
        let mut buffer = SweepResultBuffer::new("keysight_rram_1t1r", &[]);
        buffer.push(
            SweepStep::new("set")
                .with_channel("v_d", vec![vec![1.0, 2.0]])
                .with_channel("i_d", vec![vec![-1e-3, 4e-3]]),
        );
        let ds = buffer.snapshot();
        assert_eq!(ds.channel("i_d_abs").unwrap()[0][0], vec![1e-3, 4e-3]);
        assert_eq!(ds.channel("res").unwrap()[0][0], vec![1000.0, 500.0]);
    }

    #[test]
    fn test_nan_serializes_as_null() {
        let mut buffer = SweepResultBuffer::new("debug", &[]);
        buffer.push(SweepStep::new("a").with_channel("v_gs", vec![vec![1.0, 2.0]]));
        buffer.push(SweepStep::new("b").with_channel("v_gs", vec![vec![3.0]]));

        let json = serde_json::to_value(buffer.snapshot()).unwrap();
        assert_eq!(json["data"]["v_gs"][1][0], serde_json::json!([3.0, null]));

        let back: ResultDataset = serde_json::from_value(json).unwrap();
        assert!(back.channel("v_gs").unwrap()[1][0][1].is_nan());
    }
}
