//! Measurement run orchestration.
//!
//! - [`run`]: the immutable run request and per-target metadata
//! - [`cancel`]: cooperative cancellation flag
//! - [`sequencer`]: the run state machine

pub mod cancel;
pub mod run;
pub mod sequencer;

pub use cancel::CancellationController;
pub use run::{format_timestamp, target_save_dir, MeasurementRun, SweepMetadata, TIMESTAMP_FORMAT};
pub use sequencer::{
    EngineState, InstrumentSet, ProgramResult, ProgramSequencer, RunHandle, RunOutcome,
};
