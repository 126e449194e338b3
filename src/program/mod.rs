//! Measurement programs: configuration, step planning and result shapes.
//!
//! A program turns its JSON configuration into an ordered list of [`StepPlan`]s.
//! The analyzer executes one plan at a time and returns a [`SweepStep`]; the
//! sequencer pushes each step into a [`SweepResultBuffer`](crate::data::SweepResultBuffer).
//!
//! Programs are looked up by tag in the [`ProgramRegistry`].

pub mod debug;
pub mod fet;
pub mod range;
pub mod registry;
pub mod rram;

pub use range::{SweepDirection, SweepRange};
pub use registry::{ProgramEntry, ProgramKind, ProgramRegistry, ResultShape};

use crate::error::{AppResult, DaqError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of a run's program chain. Order within a run is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Program type tag, e.g. `keysight_id_vgs`
    pub name: String,
    /// Program parameters
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ProgramConfig {
    /// Program config with parameters.
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Instructions for one named sub-sequence of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    /// Position in the program's step list
    pub index: usize,
    /// Step name ("form", "set", "v_ds=-0.05", ...)
    pub name: String,
    /// SMU channel number for each terminal
    pub probes: BTreeMap<String, u8>,
    /// Channel swept by the staircase (`v_gs`, `v_d`, ...)
    pub sweep_channel: String,
    /// Staircase points, before direction is applied
    pub sweep_values: Vec<f64>,
    /// Staircase directions, in execution order
    pub directions: Vec<SweepDirection>,
    /// Constant voltages held during the sweep, keyed by channel
    pub biases: BTreeMap<String, f64>,
    /// Current compliance in A
    pub compliance: f64,
    /// Pulsed staircase timing; `None` for a DC sweep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<PulseTiming>,
}

/// Pulse timing of a pulsed-DC staircase.
///
/// The swept terminal idles at `base` and steps to each staircase value for
/// `width` seconds once per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseTiming {
    /// Pulse width in s
    pub width: f64,
    /// Pulse period in s
    pub period: f64,
    /// Voltage between pulses
    pub base: f64,
}

impl PulseTiming {
    /// Validated pulse timing.
    pub fn new(width: f64, period: f64, base: f64) -> AppResult<Self> {
        if !(width.is_finite() && period.is_finite() && base.is_finite()) {
            return Err(DaqError::InvalidInput(
                "Pulse timing must be finite".to_string(),
            ));
        }
        if width <= 0.0 || period < width {
            return Err(DaqError::InvalidInput(format!(
                "Pulse width {width} s must be positive and no longer than period {period} s"
            )));
        }
        Ok(Self {
            width,
            period,
            base,
        })
    }
}

impl StepPlan {
    /// Points per direction.
    pub fn num_points(&self) -> usize {
        self.sweep_values.len()
    }

    /// Direction slots this step fills.
    pub fn num_directions(&self) -> usize {
        SweepDirection::count_total(&self.directions)
    }

    /// Sweep points for each direction slot.
    pub fn direction_values(&self) -> Vec<Vec<f64>> {
        self.directions
            .iter()
            .flat_map(|d| d.apply(&self.sweep_values))
            .collect()
    }
}

/// Result of executing one [`StepPlan`].
///
/// `channels` maps a channel name to one sample array per direction. Arrays may
/// differ in length; the buffer records the longest as the step's true length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    /// Step name, copied from the plan
    pub name: String,
    /// Channel -> direction -> samples
    pub channels: BTreeMap<String, Vec<Vec<f64>>>,
}

impl SweepStep {
    /// Empty step with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: BTreeMap::new(),
        }
    }

    /// Builder-style channel insert.
    pub fn with_channel(mut self, channel: impl Into<String>, directions: Vec<Vec<f64>>) -> Self {
        self.channels.insert(channel.into(), directions);
        self
    }

    /// Longest sample array across channels and directions.
    pub fn num_points(&self) -> usize {
        self.channels
            .values()
            .flat_map(|dirs| dirs.iter().map(Vec::len))
            .max()
            .unwrap_or(0)
    }

    /// Largest direction count across channels.
    pub fn num_directions(&self) -> usize {
        self.channels.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// Deserialize a program config, filling missing keys from `T::default()`.
pub(crate) fn parse_config<T>(program: &str, config: &serde_json::Value) -> AppResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(config.clone()).map_err(|e| {
        DaqError::InvalidInput(format!("Invalid config for program '{program}': {e}"))
    })
}

/// Serialize a default config struct to JSON.
pub(crate) fn config_value<T: Serialize>(config: &T) -> serde_json::Value {
    serde_json::to_value(config).unwrap_or_else(|_| empty_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_plan_direction_values() {
        let plan = StepPlan {
            index: 0,
            name: "v_ds=0.1".into(),
            probes: BTreeMap::new(),
            sweep_channel: "v_gs".into(),
            sweep_values: vec![0.0, 1.0, 2.0],
            directions: vec![SweepDirection::ForwardReverse, SweepDirection::Forward],
            biases: BTreeMap::new(),
            compliance: 1e-3,
            pulse: None,
        };
        assert_eq!(plan.num_points(), 3);
        assert_eq!(plan.num_directions(), 3);
        assert_eq!(
            plan.direction_values(),
            vec![
                vec![0.0, 1.0, 2.0],
                vec![2.0, 1.0, 0.0],
                vec![0.0, 1.0, 2.0]
            ]
        );
    }

    #[test]
    fn test_sweep_step_true_length_is_longest_channel() {
        let step = SweepStep::new("set")
            .with_channel("v_d", vec![vec![0.0, 0.1, 0.2], vec![0.2, 0.1, 0.0]])
            .with_channel("i_d", vec![vec![1e-6, 2e-6]]);
        assert_eq!(step.num_points(), 3);
        assert_eq!(step.num_directions(), 2);
        assert_eq!(SweepStep::new("empty").num_points(), 0);
    }

    #[test]
    fn test_pulse_timing_validation() {
        let pulse = PulseTiming::new(0.001, 0.01, 0.0).unwrap();
        assert_eq!(pulse.width, 0.001);
        assert!(PulseTiming::new(0.0, 0.01, 0.0).is_err());
        assert!(PulseTiming::new(0.02, 0.01, 0.0).is_err());
        assert!(PulseTiming::new(f64::NAN, 0.01, 0.0).is_err());
    }

    #[test]
    fn test_program_config_defaults_to_empty_object() {
        let cfg: ProgramConfig = serde_json::from_str(r#"{"name": "debug"}"#).unwrap();
        assert!(cfg.config.as_object().unwrap().is_empty());
    }
}
