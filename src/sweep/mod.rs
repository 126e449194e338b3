//! Sweep strategies: which devices a run visits, and in what order.
//!
//! | kind     | config                                                          |
//! |----------|-----------------------------------------------------------------|
//! | `single` | none; measures the start device                                 |
//! | `array`  | `num_rows`, `num_cols`, `sweep_order` (`row`/`col`), opt. `dies` |
//! | `list`   | `modules` (name -> local `x`, `y` in µm), `order`, opt. `dies`  |

pub mod targets;

pub use targets::{StartAddress, Target, MAX_SWEEP_TARGETS};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sweep strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    /// One device
    Single,
    /// Rectangular device grid, optionally repeated over several dies
    Array,
    /// Named device positions
    List,
}

impl SweepKind {
    /// Every sweep kind.
    pub const ALL: [SweepKind; 3] = [SweepKind::Single, SweepKind::Array, SweepKind::List];

    /// Lowercase tag.
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Single => "single",
            SweepKind::Array => "array",
            SweepKind::List => "list",
        }
    }

    /// Default `config` for this kind.
    pub fn default_config(self) -> serde_json::Value {
        let value = match self {
            SweepKind::Single => serde_json::to_value(SingleSweepConfig::default()),
            SweepKind::Array => serde_json::to_value(ArraySweepConfig::default()),
            SweepKind::List => serde_json::to_value(ListSweepConfig::default()),
        };
        value.unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(SweepKind::Single),
            "array" => Ok(SweepKind::Array),
            "list" => Ok(SweepKind::List),
            _ => Err(DaqError::UnknownSweep(s.to_string())),
        }
    }
}

/// Sweep strategy plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Strategy
    #[serde(alias = "name")]
    pub kind: SweepKind,
    /// Strategy parameters
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SweepSpec {
    /// Single-device sweep.
    pub fn single() -> Self {
        Self {
            kind: SweepKind::Single,
            config: SweepKind::Single.default_config(),
        }
    }

    /// Array sweep.
    pub fn array(config: ArraySweepConfig) -> Self {
        Self {
            kind: SweepKind::Array,
            config: serde_json::to_value(config).unwrap_or_default(),
        }
    }

    /// List sweep.
    pub fn list(config: ListSweepConfig) -> Self {
        Self {
            kind: SweepKind::List,
            config: serde_json::to_value(config).unwrap_or_default(),
        }
    }

    /// Expand into the ordered targets of a run.
    pub fn targets(&self, start: &StartAddress) -> AppResult<Vec<Target>> {
        let targets = match self.kind {
            SweepKind::Single => {
                parse_sweep_config::<SingleSweepConfig>(self.kind, &self.config)?;
                targets::single(start)
            }
            SweepKind::Array => {
                let cfg: ArraySweepConfig = parse_sweep_config(self.kind, &self.config)?;
                targets::array(start, &cfg)?
            }
            SweepKind::List => {
                let cfg: ListSweepConfig = parse_sweep_config(self.kind, &self.config)?;
                targets::list(start, &cfg)?
            }
        };
        if targets.is_empty() {
            return Err(DaqError::InvalidInput(format!(
                "Sweep '{}' has no targets",
                self.kind
            )));
        }
        Ok(targets)
    }
}

fn parse_sweep_config<T>(kind: SweepKind, config: &serde_json::Value) -> AppResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| DaqError::InvalidInput(format!("Invalid config for sweep '{kind}': {e}")))
}

/// Single sweep takes no parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleSweepConfig {}

/// Iteration order inside a device array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepOrder {
    /// Columns within a row, then the next row (`r0_c0`, `r0_c1`, ...)
    #[default]
    Row,
    /// Rows within a column, then the next column (`c0_r0`, `c0_r1`, ...)
    Col,
}

/// Device grid, relative to the start device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArraySweepConfig {
    /// Rows per die
    pub num_rows: u32,
    /// Columns per die
    pub num_cols: u32,
    /// Iteration order
    pub sweep_order: SweepOrder,
    /// Dies to visit, in order; the start die when empty
    pub dies: Vec<[i32; 2]>,
}

impl Default for ArraySweepConfig {
    fn default() -> Self {
        Self {
            num_rows: 1,
            num_cols: 1,
            sweep_order: SweepOrder::Row,
            dies: Vec::new(),
        }
    }
}

/// Local position of a named module inside a die, in µm from the start device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulePosition {
    /// x offset in µm
    pub x: f64,
    /// y offset in µm
    pub y: f64,
}

/// Named module positions and the order to visit them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSweepConfig {
    /// Module name -> position
    pub modules: BTreeMap<String, ModulePosition>,
    /// Module names to measure, in order
    #[serde(alias = "sweep")]
    pub order: Vec<String>,
    /// Dies to visit, in order; the start die when empty
    pub dies: Vec<[i32; 2]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sweep_kind_parse() {
        assert_eq!("Array".parse::<SweepKind>().unwrap(), SweepKind::Array);
        assert!(matches!(
            "spiral".parse::<SweepKind>(),
            Err(DaqError::UnknownSweep(_))
        ));
    }

    #[test]
    fn test_spec_accepts_name_alias() {
        let spec: SweepSpec =
            serde_json::from_value(json!({"name": "array", "config": {"num_rows": 2}})).unwrap();
        assert_eq!(spec.kind, SweepKind::Array);
        let targets = spec.targets(&StartAddress::default()).unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_invalid_sweep_order_rejected() {
        let spec = SweepSpec {
            kind: SweepKind::Array,
            config: json!({"sweep_order": "diagonal"}),
        };
        assert!(spec.targets(&StartAddress::default()).is_err());
    }

    #[test]
    fn test_default_configs_expand() {
        for kind in [SweepKind::Single, SweepKind::Array] {
            let spec = SweepSpec {
                kind,
                config: kind.default_config(),
            };
            assert_eq!(spec.targets(&StartAddress::default()).unwrap().len(), 1);
        }
        // An empty list sweep has nothing to measure.
        let spec = SweepSpec {
            kind: SweepKind::List,
            config: SweepKind::List.default_config(),
        };
        assert!(spec.targets(&StartAddress::default()).is_err());
    }
}
