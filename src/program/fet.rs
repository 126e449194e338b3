//! FET current-voltage programs: Id-Vgs at constant Vds biases and Id-Vds at
//! constant Vgs biases.
//!
//! Each bias value is one step; within a step the swept terminal runs a staircase
//! in every direction of `sweep_direction` (`"fr"` by default, to expose hysteresis).
//! The pulsed-DC variants pulse the swept terminal from a base voltage instead of
//! holding each staircase value.

use super::range::{SweepDirection, SweepRange};
use super::{parse_config, PulseTiming, StepPlan};
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channels recorded by FET programs.
pub const FET_CHANNELS: &[&str] = &["v_ds", "v_gs", "i_d", "i_s", "i_g"];

/// Parameters shared by the Id-Vgs and Id-Vds programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetIvConfig {
    /// SMU channel on the gate
    pub probe_gate: u8,
    /// SMU channel on the source
    pub probe_source: u8,
    /// SMU channel on the drain
    pub probe_drain: u8,
    /// SMU channel on the substrate
    pub probe_sub: u8,
    /// Gate voltages
    pub v_gs: SweepRange,
    /// Drain voltages
    pub v_ds: SweepRange,
    /// Substrate voltage
    pub v_sub: f64,
    /// Direction pattern, e.g. `"fr"`
    pub sweep_direction: String,
    /// Drain current compliance in A
    pub id_compliance: f64,
}

impl FetIvConfig {
    /// Defaults for an Id-Vgs transfer curve.
    pub fn id_vgs_default() -> Self {
        Self {
            probe_gate: 1,
            probe_source: 8,
            probe_drain: 4,
            probe_sub: 9,
            v_gs: SweepRange::linear(-1.2, 1.2, 0.1),
            v_ds: SweepRange::List(vec![-0.05, -1.2]),
            v_sub: 0.0,
            sweep_direction: "fr".to_string(),
            id_compliance: 0.1,
        }
    }

    /// Defaults for an Id-Vds output curve.
    pub fn id_vds_default() -> Self {
        Self {
            v_gs: SweepRange::linear(0.0, -1.2, 0.4),
            v_ds: SweepRange::linear(0.0, -2.0, 0.1),
            ..Self::id_vgs_default()
        }
    }

    fn probes(&self) -> BTreeMap<String, u8> {
        BTreeMap::from([
            ("gate".to_string(), self.probe_gate),
            ("source".to_string(), self.probe_source),
            ("drain".to_string(), self.probe_drain),
            ("sub".to_string(), self.probe_sub),
        ])
    }
}

impl Default for FetIvConfig {
    fn default() -> Self {
        Self::id_vgs_default()
    }
}

/// Pulsed-DC FET program parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetPulsedConfig {
    /// Bias and staircase parameters
    #[serde(flatten)]
    pub iv: FetIvConfig,
    /// Pulse width in s
    #[serde(default = "default_pulse_width")]
    pub pulse_width: f64,
    /// Pulse period in s
    #[serde(default = "default_pulse_period")]
    pub pulse_period: f64,
    /// Swept terminal voltage between pulses
    #[serde(default)]
    pub pulse_base: f64,
}

fn default_pulse_width() -> f64 {
    0.001
}

fn default_pulse_period() -> f64 {
    0.01
}

impl FetPulsedConfig {
    /// Defaults for a pulsed Id-Vgs transfer curve.
    pub fn id_vgs_default() -> Self {
        Self {
            iv: FetIvConfig::id_vgs_default(),
            pulse_width: 0.001,
            pulse_period: 0.01,
            pulse_base: 0.0,
        }
    }

    /// Defaults for a pulsed Id-Vds output curve.
    pub fn id_vds_default() -> Self {
        Self {
            iv: FetIvConfig::id_vds_default(),
            pulse_width: 0.0005,
            ..Self::id_vgs_default()
        }
    }
}

impl Default for FetPulsedConfig {
    fn default() -> Self {
        Self::id_vgs_default()
    }
}

/// Which terminal is swept inside each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetSweep {
    /// Sweep Vgs, one step per Vds bias
    IdVgs,
    /// Sweep Vds, one step per Vgs bias
    IdVds,
}

/// Plan an FET I-V program.
pub fn plan(program: &str, sweep: FetSweep, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
    let cfg: FetIvConfig = parse_config(program, config)?;
    plan_steps(&cfg, sweep, None)
}

/// Plan a pulsed-DC FET I-V program. The swept terminal carries the pulses.
pub fn plan_pulsed(
    program: &str,
    sweep: FetSweep,
    config: &serde_json::Value,
) -> AppResult<Vec<StepPlan>> {
    let cfg: FetPulsedConfig = parse_config(program, config)?;
    let pulse = PulseTiming::new(cfg.pulse_width, cfg.pulse_period, cfg.pulse_base)?;
    plan_steps(&cfg.iv, sweep, Some(pulse))
}

fn plan_steps(
    cfg: &FetIvConfig,
    sweep: FetSweep,
    pulse: Option<PulseTiming>,
) -> AppResult<Vec<StepPlan>> {
    let directions = SweepDirection::parse_pattern(&cfg.sweep_direction)?;
    let v_gs = cfg.v_gs.values()?;
    let v_ds = cfg.v_ds.values()?;

    let (bias_channel, bias_values, sweep_channel, sweep_values) = match sweep {
        FetSweep::IdVgs => ("v_ds", v_ds, "v_gs", v_gs),
        FetSweep::IdVds => ("v_gs", v_gs, "v_ds", v_ds),
    };

    let probes = cfg.probes();
    Ok(bias_values
        .iter()
        .enumerate()
        .map(|(index, &bias)| StepPlan {
            index,
            name: format!("{bias_channel}={bias}"),
            probes: probes.clone(),
            sweep_channel: sweep_channel.to_string(),
            sweep_values: sweep_values.clone(),
            directions: directions.clone(),
            biases: BTreeMap::from([
                (bias_channel.to_string(), bias),
                ("v_sub".to_string(), cfg.v_sub),
            ]),
            compliance: cfg.id_compliance,
            pulse,
        })
        .collect())
}
