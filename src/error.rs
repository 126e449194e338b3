//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! instrument failures in the middle of a measurement run.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups errors into the categories the orchestrator cares about:
//!
//! - **Input errors** (`InvalidInput`, `UnknownUser`, `UnknownProgram`, `UnknownSweep`,
//!   `MissingDataFolder`, `NotConnected`): rejected before any instrument or stage command
//!   is issued. No partial state mutation happens.
//! - **Run gating** (`AlreadyRunning`, `Busy`): a second run, or a disconnect, was requested
//!   while a measurement run holds the instruments.
//! - **Instrument errors** (`Instrument`): a driver reported a failure. These abort the
//!   active run; they are never retried.
//! - **Persistence** (`Storage`): a result writer failed; the run is aborted like an
//!   instrument error.
//! - **Configuration** (`Config`, `Configuration`) and plumbing (`Io`, `Json`, `Task`).
//!
//! Cancellation is deliberately absent: a cancelled run is a normal terminal outcome.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A measurement run is already active")]
    AlreadyRunning,

    #[error("Instrument busy: {0}")]
    Busy(String),

    #[error("Instrument not connected: {0}")]
    NotConnected(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown measurement program: {0}")]
    UnknownProgram(String),

    #[error("Unknown measurement sweep: {0}")]
    UnknownSweep(String),

    #[error("Data folder does not exist: {0}")]
    MissingDataFolder(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Run task error: {0}")]
    Task(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Wrap a driver-level `anyhow` error, keeping the full context chain.
    pub fn instrument(err: anyhow::Error) -> Self {
        DaqError::Instrument(format!("{err:#}"))
    }

    /// True for errors raised before any instrument command was issued.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidInput(_)
                | DaqError::UnknownUser(_)
                | DaqError::UnknownProgram(_)
                | DaqError::UnknownSweep(_)
                | DaqError::MissingDataFolder(_)
                | DaqError::NotConnected(_)
        )
    }
}
