//! Tracing initialisation.
//!
//! The filter comes from `application.log_level` unless `RUST_LOG` is set, in which
//! case `RUST_LOG` wins (e.g. `RUST_LOG=wafer_daq::experiment=debug`).

use crate::config::{LogFormat, Settings};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build the env filter for a configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber according to the settings.
///
/// Fails if a global subscriber is already installed.
pub fn init_from_config(settings: &Settings) -> AppResult<()> {
    let filter = env_filter(&settings.application.log_level);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match settings.application.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    result.map_err(|e| DaqError::Configuration(format!("Failed to initialise tracing: {e}")))
}
