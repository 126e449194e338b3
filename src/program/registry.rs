use super::debug::{self, DebugConfig};
use super::fet::{self, FetIvConfig, FetPulsedConfig, FetSweep, FET_CHANNELS};
use super::rram::{
    self, Rram1T1RConfig, Rram1T1RSequenceConfig, Rram1T1RSweepConfig, RRAM_CHANNELS,
};
use super::{config_value, StepPlan};
use crate::error::{AppResult, DaqError};
use std::collections::HashMap;

/// Planning strategy of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// Synthetic Id-Vgs style program
    Debug,
    /// Id-Vgs transfer curves
    IdVgs,
    /// Id-Vds output curves
    IdVds,
    /// Id-Vgs with a pulsed gate
    IdVgsPulsed,
    /// Id-Vds with a pulsed drain
    IdVdsPulsed,
    /// RRAM form/set/reset sequence
    Rram1T1R,
    /// RRAM gate/drain grid between resets
    Rram1T1RSweep,
    /// RRAM user-defined code sequence
    Rram1T1RSequence,
}

impl ProgramKind {
    /// Expand a (complete) config into ordered step plans.
    pub fn plan(self, program: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
        match self {
            ProgramKind::Debug => debug::plan(program, config),
            ProgramKind::IdVgs => fet::plan(program, FetSweep::IdVgs, config),
            ProgramKind::IdVds => fet::plan(program, FetSweep::IdVds, config),
            ProgramKind::IdVgsPulsed => fet::plan_pulsed(program, FetSweep::IdVgs, config),
            ProgramKind::IdVdsPulsed => fet::plan_pulsed(program, FetSweep::IdVds, config),
            ProgramKind::Rram1T1R => rram::plan_form_set_reset(program, config),
            ProgramKind::Rram1T1RSweep => rram::plan_gate_drain_sweep(program, config),
            ProgramKind::Rram1T1RSequence => rram::plan_code_sequence(program, config),
        }
    }
}

/// Channels a program's dataset always carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultShape {
    /// Measured channel names
    pub channels: &'static [&'static str],
}

/// One registered program.
#[derive(Debug, Clone)]
pub struct ProgramEntry {
    /// Planning strategy
    pub kind: ProgramKind,
    /// Dataset channels
    pub shape: ResultShape,
    /// Full default configuration
    pub default_config: serde_json::Value,
}

/// Program tag -> planning strategy and result shape.
#[derive(Debug, Clone)]
pub struct ProgramRegistry {
    programs: HashMap<String, ProgramEntry>,
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramRegistry {
    /// Registry with every built-in program.
    pub fn new() -> Self {
        let fet_shape = ResultShape {
            channels: FET_CHANNELS,
        };
        let rram_shape = ResultShape {
            channels: RRAM_CHANNELS,
        };

        let mut programs = HashMap::new();
        programs.insert(
            "debug".to_string(),
            ProgramEntry {
                kind: ProgramKind::Debug,
                shape: fet_shape,
                default_config: config_value(&DebugConfig::default()),
            },
        );
        programs.insert(
            "keysight_id_vgs".to_string(),
            ProgramEntry {
                kind: ProgramKind::IdVgs,
                shape: fet_shape,
                default_config: config_value(&FetIvConfig::id_vgs_default()),
            },
        );
        programs.insert(
            "keysight_id_vds".to_string(),
            ProgramEntry {
                kind: ProgramKind::IdVds,
                shape: fet_shape,
                default_config: config_value(&FetIvConfig::id_vds_default()),
            },
        );
        programs.insert(
            "keysight_id_vgs_pulsed_dc".to_string(),
            ProgramEntry {
                kind: ProgramKind::IdVgsPulsed,
                shape: fet_shape,
                default_config: config_value(&FetPulsedConfig::id_vgs_default()),
            },
        );
        programs.insert(
            "keysight_id_vds_pulsed_dc".to_string(),
            ProgramEntry {
                kind: ProgramKind::IdVdsPulsed,
                shape: fet_shape,
                default_config: config_value(&FetPulsedConfig::id_vds_default()),
            },
        );
        programs.insert(
            "keysight_rram_1t1r".to_string(),
            ProgramEntry {
                kind: ProgramKind::Rram1T1R,
                shape: rram_shape,
                default_config: config_value(&Rram1T1RConfig::default()),
            },
        );
        programs.insert(
            "keysight_rram_1t1r_sweep".to_string(),
            ProgramEntry {
                kind: ProgramKind::Rram1T1RSweep,
                shape: rram_shape,
                default_config: config_value(&Rram1T1RSweepConfig::default()),
            },
        );
        programs.insert(
            "keysight_rram_1t1r_sequence".to_string(),
            ProgramEntry {
                kind: ProgramKind::Rram1T1RSequence,
                shape: rram_shape,
                default_config: config_value(&Rram1T1RSequenceConfig::default()),
            },
        );

        Self { programs }
    }

    /// Look up a program by tag (case-insensitive).
    pub fn get(&self, name: &str) -> AppResult<&ProgramEntry> {
        self.programs
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| DaqError::UnknownProgram(name.to_string()))
    }

    /// True if the tag is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Registered tags, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.programs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Default configuration of a program.
    pub fn default_config(&self, name: &str) -> AppResult<serde_json::Value> {
        Ok(self.get(name)?.default_config.clone())
    }

    /// Plan a program; keys missing from `config` take the program's defaults.
    pub fn plan(&self, name: &str, config: &serde_json::Value) -> AppResult<Vec<StepPlan>> {
        let entry = self.get(name)?;
        let mut merged = entry.default_config.clone();
        merge_config(&mut merged, config)?;
        let plans = entry.kind.plan(name, &merged)?;
        if plans.is_empty() {
            return Err(DaqError::InvalidInput(format!(
                "Program '{name}' planned no steps"
            )));
        }
        Ok(plans)
    }
}

/// Overlay the top-level keys of `overrides` onto `base`.
fn merge_config(base: &mut serde_json::Value, overrides: &serde_json::Value) -> AppResult<()> {
    match (base.as_object_mut(), overrides) {
        (_, serde_json::Value::Null) => Ok(()),
        (Some(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
            Ok(())
        }
        _ => Err(DaqError::InvalidInput(format!(
            "Program config must be a table, got {overrides}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_programs_registered() {
        let registry = ProgramRegistry::new();
        assert_eq!(
            registry.names(),
            vec![
                "debug",
                "keysight_id_vds",
                "keysight_id_vds_pulsed_dc",
                "keysight_id_vgs",
                "keysight_id_vgs_pulsed_dc",
                "keysight_rram_1t1r",
                "keysight_rram_1t1r_sequence",
                "keysight_rram_1t1r_sweep"
            ]
        );
        assert_eq!(
            registry.get("keysight_rram_1t1r").unwrap().shape.channels,
            RRAM_CHANNELS
        );
    }

    #[test]
    fn test_unknown_program() {
        let registry = ProgramRegistry::new();
        assert!(matches!(
            registry.plan("keysight_cv", &json!({})),
            Err(DaqError::UnknownProgram(_))
        ));
    }

    #[test]
    fn test_defaults_plan_cleanly() {
        let registry = ProgramRegistry::new();
        for name in registry.names() {
            let steps = registry.plan(name, &json!({})).unwrap();
            assert!(!steps.is_empty(), "{name} planned no steps");
        }
    }

    #[test]
    fn test_partial_config_uses_program_defaults() {
        let registry = ProgramRegistry::new();
        // Only v_gs overridden: v_ds keeps the Id-Vds default staircase.
        let steps = registry
            .plan("keysight_id_vds", &json!({"v_gs": [-1.0]}))
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].num_points(), 21);
    }

    #[test]
    fn test_pulsed_programs_plan_pulses() {
        let registry = ProgramRegistry::new();
        let steps = registry
            .plan("keysight_id_vds_pulsed_dc", &json!({"pulse_width": 0.002}))
            .unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| s.pulse.map(|p| p.width) == Some(0.002)));
        assert!(registry
            .plan("keysight_id_vds", &json!({}))
            .unwrap()
            .iter()
            .all(|s| s.pulse.is_none()));
    }

    #[test]
    fn test_rram_sweep_registered() {
        let registry = ProgramRegistry::new();
        let steps = registry
            .plan("keysight_rram_1t1r_sweep", &json!({"v_g_range": [0.5]}))
            .unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[4].name, "reset");
    }

    #[test]
    fn test_non_table_config_rejected() {
        let registry = ProgramRegistry::new();
        assert!(registry.plan("debug", &json!([1, 2])).is_err());
    }
}
