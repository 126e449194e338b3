//! Debug program for exercising the run engine without real devices.
//!
//! Plans like Id-Vgs: one step per `v_ds` bias, sweeping `v_gs`.

use super::range::{SweepDirection, SweepRange};
use super::{parse_config, StepPlan};
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Debug program parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Swept gate values
    pub v_gs: SweepRange,
    /// One step per drain bias
    pub v_ds: SweepRange,
    /// Direction pattern
    pub sweep_direction: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            v_gs: SweepRange::List(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
            v_ds: SweepRange::List(vec![0.5, 1.0, 4.0]),
            sweep_direction: "fr".to_string(),
        }
    }
}

/// Plan the debug program.
pub fn plan(program: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
    let cfg: DebugConfig = parse_config(program, config)?;
    let directions = SweepDirection::parse_pattern(&cfg.sweep_direction)?;
    let v_gs = cfg.v_gs.values()?;

    Ok(cfg
        .v_ds
        .values()?
        .into_iter()
        .enumerate()
        .map(|(index, v_ds)| StepPlan {
            index,
            name: format!("v_ds={v_ds}"),
            probes: BTreeMap::new(),
            sweep_channel: "v_gs".to_string(),
            sweep_values: v_gs.clone(),
            directions: directions.clone(),
            biases: BTreeMap::from([("v_ds".to_string(), v_ds)]),
            compliance: 1e-3,
            pulse: None,
        })
        .collect())
}
