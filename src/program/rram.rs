//! 1T1R RRAM programs.
//!
//! A 1T1R cell is an access FET in series with a resistive element. Each step
//! holds the gate (word line) and source constant and sweeps the drain (bit line)
//! from 0 V to the step's end voltage and back.
//!
//! - `keysight_rram_1t1r`: a sequence string of `f` (form), `s` (set) and `r`
//!   (reset) characters, e.g. `"frsrsr"`.
//! - `keysight_rram_1t1r_sweep`: a gate/drain grid that resets the cell before
//!   each gate voltage, used to locate set and reset points.
//! - `keysight_rram_1t1r_sequence`: user-defined voltage codes and a list of code
//!   names to run in order.
//!
//! Steps of one run usually have different point counts (a form sweep to 2.5 V is
//! longer than a set sweep to 2.0 V); the result buffer pads them.

use super::range::{SweepDirection, SweepRange};
use super::{parse_config, StepPlan};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channels recorded by RRAM programs.
pub const RRAM_CHANNELS: &[&str] = &["v_s", "v_d", "v_g", "i_s", "i_d", "i_g"];

/// Terminal wiring shared by the RRAM programs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RramProbes {
    /// Word line (gate)
    pub probe_wl: u8,
    /// Source line
    pub probe_sl: u8,
    /// Bit line (drain)
    pub probe_bl: u8,
    /// Substrate
    pub probe_sub: u8,
}

impl Default for RramProbes {
    fn default() -> Self {
        Self {
            probe_wl: 1,
            probe_sl: 4,
            probe_bl: 8,
            probe_sub: 9,
        }
    }
}

impl RramProbes {
    fn map(&self) -> BTreeMap<String, u8> {
        BTreeMap::from([
            ("wl".to_string(), self.probe_wl),
            ("sl".to_string(), self.probe_sl),
            ("bl".to_string(), self.probe_bl),
            ("sub".to_string(), self.probe_sub),
        ])
    }
}

/// Constant biases and sweep end point of one RRAM operation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RramBias {
    v_sub: f64,
    v_s: f64,
    v_g: f64,
    v_d_stop: f64,
    compliance: f64,
}

impl RramBias {
    fn plan(&self, index: usize, name: &str, probes: &RramProbes, v_step: f64) -> AppResult<StepPlan> {
        let sweep_values = SweepRange::linear(0.0, self.v_d_stop, v_step).values()?;
        Ok(StepPlan {
            index,
            name: name.to_string(),
            probes: probes.map(),
            sweep_channel: "v_d".to_string(),
            sweep_values,
            directions: vec![SweepDirection::ForwardReverse],
            biases: BTreeMap::from([
                ("v_s".to_string(), self.v_s),
                ("v_g".to_string(), self.v_g),
                ("v_sub".to_string(), self.v_sub),
            ]),
            compliance: self.compliance,
            pulse: None,
        })
    }
}

/// Parameters of the form/set/reset sequence program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rram1T1RConfig {
    /// Terminal wiring
    #[serde(flatten)]
    pub probes: RramProbes,
    /// Substrate voltage
    pub v_sub: f64,
    /// Form: source voltage
    pub v_s_form: f64,
    /// Form: drain sweep end
    pub v_d_form: f64,
    /// Form: gate voltage
    pub v_g_form: f64,
    /// Reset: source voltage
    pub v_s_reset: f64,
    /// Reset: drain sweep end
    pub v_d_reset: f64,
    /// Reset: gate voltage
    pub v_g_reset: f64,
    /// Set: source voltage
    pub v_s_set: f64,
    /// Set: drain sweep end
    pub v_d_set: f64,
    /// Set: gate voltage
    pub v_g_set: f64,
    /// Drain staircase step
    pub v_step: f64,
    /// Form current compliance in A
    pub i_compliance_form: f64,
    /// Set current compliance in A
    pub i_compliance_set: f64,
    /// Reset current compliance in A
    pub i_compliance_reset: f64,
    /// Operation codes, e.g. `"frsrsr"`
    pub sequence: String,
}

impl Default for Rram1T1RConfig {
    fn default() -> Self {
        Self {
            probes: RramProbes::default(),
            v_sub: 0.0,
            v_s_form: 0.0,
            v_d_form: 2.5,
            v_g_form: -0.6,
            v_s_reset: 0.0,
            v_d_reset: -2.0,
            v_g_reset: -1.5,
            v_s_set: 0.0,
            v_d_set: 2.0,
            v_g_set: -0.6,
            v_step: 0.1,
            i_compliance_form: 1e-3,
            i_compliance_set: 1e-3,
            i_compliance_reset: 1e-3,
            sequence: "frs".to_string(),
        }
    }
}

/// Plan `keysight_rram_1t1r`: one step per character of `sequence`.
pub fn plan_form_set_reset(program: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
    let cfg: Rram1T1RConfig = parse_config(program, config)?;
    if cfg.sequence.is_empty() {
        return Err(DaqError::InvalidInput(format!(
            "Program '{program}' has an empty sequence"
        )));
    }

    let form = RramBias {
        v_sub: cfg.v_sub,
        v_s: cfg.v_s_form,
        v_g: cfg.v_g_form,
        v_d_stop: cfg.v_d_form,
        compliance: cfg.i_compliance_form,
    };
    let set = RramBias {
        v_sub: cfg.v_sub,
        v_s: cfg.v_s_set,
        v_g: cfg.v_g_set,
        v_d_stop: cfg.v_d_set,
        compliance: cfg.i_compliance_set,
    };
    let reset = RramBias {
        v_sub: cfg.v_sub,
        v_s: cfg.v_s_reset,
        v_g: cfg.v_g_reset,
        v_d_stop: cfg.v_d_reset,
        compliance: cfg.i_compliance_reset,
    };

    cfg.sequence
        .chars()
        .enumerate()
        .map(|(index, code)| match code.to_ascii_lowercase() {
            'f' => form.plan(index, "form", &cfg.probes, cfg.v_step),
            's' => set.plan(index, "set", &cfg.probes, cfg.v_step),
            'r' => reset.plan(index, "reset", &cfg.probes, cfg.v_step),
            other => Err(DaqError::InvalidInput(format!(
                "Invalid sweep code '{other}' in sequence '{}'",
                cfg.sequence
            ))),
        })
        .collect()
}

/// Parameters of the gate/drain sweep program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rram1T1RSweepConfig {
    /// Terminal wiring
    #[serde(flatten)]
    pub probes: RramProbes,
    /// Substrate voltage
    pub v_sub: f64,
    /// Source voltage
    pub v_s: f64,
    /// Reset gate voltage
    pub v_g_reset: f64,
    /// Reset drain sweep end
    pub v_d_reset: f64,
    /// Gate voltages, outer loop
    pub v_g_range: SweepRange,
    /// Drain sweep ends, inner loop
    pub v_d_range: SweepRange,
    /// Drain staircase step
    pub v_step: f64,
    /// Drain current compliance in A
    pub i_d_compliance: f64,
}

impl Default for Rram1T1RSweepConfig {
    fn default() -> Self {
        Self {
            probes: RramProbes::default(),
            v_sub: 0.0,
            v_s: 0.0,
            v_g_reset: -1.0,
            v_d_reset: -2.0,
            v_g_range: SweepRange::List(vec![0.4, 0.6, 0.8]),
            v_d_range: SweepRange::List(vec![1.0, 1.5, 2.5]),
            v_step: 0.1,
            i_d_compliance: 10e-3,
        }
    }
}

/// Plan `keysight_rram_1t1r_sweep`.
///
/// For each gate voltage: a reset, then one set sweep per drain end voltage.
/// A final reset leaves the cell in its high resistance state.
pub fn plan_gate_drain_sweep(program: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
    let cfg: Rram1T1RSweepConfig = parse_config(program, config)?;
    let v_g_range = cfg.v_g_range.values()?;
    let v_d_range = cfg.v_d_range.values()?;
    if v_g_range.is_empty() || v_d_range.is_empty() {
        return Err(DaqError::InvalidInput(format!(
            "Program '{program}' needs at least one gate and one drain voltage"
        )));
    }

    let reset = RramBias {
        v_sub: cfg.v_sub,
        v_s: cfg.v_s,
        v_g: cfg.v_g_reset,
        v_d_stop: cfg.v_d_reset,
        compliance: cfg.i_d_compliance,
    };

    let mut steps = Vec::with_capacity(v_g_range.len() * (v_d_range.len() + 1) + 1);
    for &v_g in &v_g_range {
        steps.push(reset.plan(steps.len(), "reset", &cfg.probes, cfg.v_step)?);
        for &v_d in &v_d_range {
            let set = RramBias {
                v_g,
                v_d_stop: v_d,
                ..reset
            };
            let name = format!("v_g={v_g}, v_d={v_d}");
            steps.push(set.plan(steps.len(), &name, &cfg.probes, cfg.v_step)?);
        }
    }
    steps.push(reset.plan(steps.len(), "reset", &cfg.probes, cfg.v_step)?);
    Ok(steps)
}

/// Voltages applied for one named code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RramCode {
    /// Substrate
    pub v_sub: f64,
    /// Source line
    pub v_sl: f64,
    /// Word line (gate)
    pub v_wl: f64,
    /// Bit line sweep end
    pub v_bl: f64,
}

/// Parameters of the user-defined code sequence program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rram1T1RSequenceConfig {
    /// Terminal wiring
    #[serde(flatten)]
    pub probes: RramProbes,
    /// Code name -> voltages
    pub codes: BTreeMap<String, RramCode>,
    /// Code names to run, in order
    pub sequence: Vec<String>,
    /// Bit line staircase step
    pub v_step: f64,
    /// Current compliance in A
    pub i_compliance: f64,
}

impl Default for Rram1T1RSequenceConfig {
    fn default() -> Self {
        let code = |v_bl| RramCode {
            v_sub: 0.0,
            v_sl: 0.0,
            v_wl: 0.0,
            v_bl,
        };
        Self {
            probes: RramProbes {
                probe_wl: 1,
                probe_sl: 8,
                probe_bl: 4,
                probe_sub: 9,
            },
            codes: BTreeMap::from([
                ("reset".to_string(), code(-3.0)),
                ("read".to_string(), code(0.5)),
                ("set1".to_string(), code(2.0)),
                ("set2".to_string(), code(2.5)),
                ("set3".to_string(), code(3.0)),
            ]),
            sequence: [
                "reset", "read", "set1", "read", "reset", "read", "set2", "read", "reset", "read",
                "set3", "read",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            v_step: 0.1,
            i_compliance: 1e-3,
        }
    }
}

/// Plan `keysight_rram_1t1r_sequence`: one step per entry of `sequence`.
pub fn plan_code_sequence(program: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
    let cfg: Rram1T1RSequenceConfig = parse_config(program, config)?;
    if cfg.sequence.is_empty() {
        return Err(DaqError::InvalidInput(format!(
            "Program '{program}' has an empty sequence"
        )));
    }

    cfg.sequence
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let code = cfg.codes.get(name).ok_or_else(|| {
                DaqError::InvalidInput(format!("Invalid code name '{name}' in sequence"))
            })?;
            RramBias {
                v_sub: code.v_sub,
                v_s: code.v_sl,
                v_g: code.v_wl,
                v_d_stop: code.v_bl,
                compliance: cfg.i_compliance,
            }
            .plan(index, name, &cfg.probes, cfg.v_step)
        })
        .collect()
}
