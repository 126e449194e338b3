//! Wafer-probe measurement orchestration.
//!
//! A run steps a probe station across dies and devices of a wafer and, at every
//! target, executes a chain of parameter-analyzer programs. Each program step
//! appends samples to a padded result dataset which is streamed to observers
//! and optionally saved.
//!
//! - [`wafer`]: die/device addressing, height compensation, stage moves
//! - [`sweep`]: expansion of a sweep strategy into ordered targets
//! - [`program`]: program registry and step planning
//! - [`instrument`]: analyzer and probe station capabilities, simulated devices
//! - [`data`]: result buffer and persistence
//! - [`experiment`]: the run sequencer and cancellation
//! - [`events`]: event and progress streams
//! - [`profile`]: per-user settings and stored configs
//! - [`controller`], [`messages`]: the command channel facade

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod events;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod messages;
pub mod profile;
pub mod program;
pub mod sweep;
pub mod wafer;

pub use controller::{Controller, ControllerHandle};
pub use error::{AppResult, DaqError};
