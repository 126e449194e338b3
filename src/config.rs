//! Controller configuration using Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. `config/wafer_daq.toml` (or the path given to [`Settings::load_from`])
//! 3. Environment variables prefixed with `WAFER_DAQ_`, nested keys separated by `__`
//!
//! ```text
//! WAFER_DAQ_APPLICATION__LOG_LEVEL=debug
//! WAFER_DAQ_INSTRUMENTS__GPIB_B1500=17
//! WAFER_DAQ_EVENTS__HISTORY_SIZE=64
//! ```
//!
//! # Example
//!
//! ```no_run
//! use wafer_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("B1500 at GPIB {}", settings.instruments.gpib_b1500);
//! # Ok::<(), wafer_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/wafer_daq.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "WAFER_DAQ_";

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Known user names
    pub users: Vec<String>,
    /// Optional wafer height calibration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_file: Option<PathBuf>,
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument addressing and stage frame
    pub instruments: InstrumentConfig,
    /// Event channel settings
    pub events: EventConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Folder holding one sub-folder per user profile
    pub users_dir: PathBuf,
    /// Period of the dirty-profile autosave task, in seconds
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, ANSI colored
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// GPIB addresses of the parameter analyzer and probe station
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    /// GPIB address of the B1500 parameter analyzer
    #[serde(default = "default_gpib_b1500")]
    pub gpib_b1500: u8,
    /// GPIB address of the Cascade probe station
    #[serde(default = "default_gpib_cascade")]
    pub gpib_cascade: u8,
    /// Invert chuck movement directions (if true, top-left is (+x, +y))
    #[serde(default = "default_invert_direction")]
    pub invert_direction: bool,
}

/// Progress/event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventConfig {
    /// Number of past events kept for reconnecting subscribers
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Broadcast channel capacity per stream
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_autosave_interval() -> u64 {
    10
}

fn default_gpib_b1500() -> u8 {
    16
}

fn default_gpib_cascade() -> u8 {
    22
}

fn default_invert_direction() -> bool {
    true
}

fn default_history_size() -> usize {
    32
}

fn default_channel_capacity() -> usize {
    256
}

fn default_users_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("wafer_daq").join("users"))
        .unwrap_or_else(|| PathBuf::from("settings/users"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            users: vec!["public".to_string()],
            calibration_file: None,
            application: ApplicationConfig {
                name: "wafer_daq".to_string(),
                log_level: "info".to_string(),
                log_format: LogFormat::default(),
                users_dir: default_users_dir(),
                autosave_interval_secs: default_autosave_interval(),
            },
            instruments: InstrumentConfig {
                gpib_b1500: default_gpib_b1500(),
                gpib_cascade: default_gpib_cascade(),
                invert_direction: default_invert_direction(),
            },
            events: EventConfig {
                history_size: default_history_size(),
                channel_capacity: default_channel_capacity(),
            },
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Persist the settings as TOML, e.g. after a GPIB address change.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Failed to serialize settings: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - GPIB addresses are within 0-30 and distinct
    /// - Event history and channel capacity are non-zero
    /// - User names are non-empty and unique
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, addr) in [
            ("gpib_b1500", self.instruments.gpib_b1500),
            ("gpib_cascade", self.instruments.gpib_cascade),
        ] {
            if addr > MAX_GPIB_ADDRESS {
                return Err(DaqError::Configuration(format!(
                    "Invalid {name} {addr}. Must be 0-{MAX_GPIB_ADDRESS}"
                )));
            }
        }
        if self.instruments.gpib_b1500 == self.instruments.gpib_cascade {
            return Err(DaqError::Configuration(format!(
                "gpib_b1500 and gpib_cascade share address {}",
                self.instruments.gpib_b1500
            )));
        }

        if self.events.channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "events.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.events.history_size == 0 {
            return Err(DaqError::Configuration(
                "events.history_size must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for user in &self.users {
            if user.trim().is_empty() {
                return Err(DaqError::Configuration("Empty user name".to_string()));
            }
            if !names.insert(user) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate user name: '{user}'"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.instruments.gpib_b1500, 16);
        assert_eq!(settings.instruments.gpib_cascade, 22);
        assert!(settings.instruments.invert_direction);
        assert_eq!(settings.events.history_size, 32);
        assert_eq!(settings.users, vec!["public".to_string()]);
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
users = ["public", "alice"]

[application]
name = "probe-bench"
log_level = "debug"
users_dir = "/tmp/wafer_users"

[instruments]
gpib_b1500 = 17
invert_direction = false
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "probe-bench");
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.instruments.gpib_b1500, 17);
        assert_eq!(settings.instruments.gpib_cascade, 22);
        assert!(!settings.instruments.invert_direction);
        assert_eq!(settings.users.len(), 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("/definitely/not/here.toml").unwrap();
        assert_eq!(settings.application.log_level, "info");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_gpib_collision_rejected() {
        let mut settings = Settings::default();
        settings.instruments.gpib_cascade = 16;
        assert!(settings.validate().is_err());

        settings.instruments.gpib_cascade = 31;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_users_rejected() {
        let mut settings = Settings::default();
        settings.users = vec!["public".into(), "public".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_save_then_load_keeps_gpib_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wafer_daq.toml");
        let mut settings = Settings::default();
        settings.instruments.gpib_cascade = 5;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.instruments.gpib_cascade, 5);
    }
}
