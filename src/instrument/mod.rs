//! Instrument capabilities used by the run engine.
//!
//! Drivers implement these traits; the sequencer only ever talks to trait objects.
//! Driver errors are `anyhow::Error` and become
//! [`DaqError::Instrument`](crate::error::DaqError::Instrument) at the sequencer
//! boundary. Low-level command encoding (GPIB strings) lives entirely in drivers.

pub mod mock;

use crate::program::{StepPlan, SweepStep};
use crate::wafer::StageDelta;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Parameter analyzer executing staircase sweeps (Keysight B1500 class).
#[async_trait]
pub trait ParameterAnalyzer: Send + Sync {
    /// `*IDN?` response.
    async fn identify(&self) -> Result<String>;

    /// Reset to a known state before a run.
    async fn reset(&self) -> Result<()>;

    /// Execute one planned step and return its samples.
    async fn execute_step(&self, plan: &StepPlan) -> Result<SweepStep>;

    /// Force every output to 0 V.
    async fn zero_outputs(&self) -> Result<()>;

    /// Disconnect every SMU channel.
    async fn close_channels(&self) -> Result<()>;
}

/// Probe station chuck and contacts (Cascade class).
#[async_trait]
pub trait ProbeStation: Send + Sync {
    /// `*IDN?` response.
    async fn identify(&self) -> Result<String>;

    /// Relative chuck move in the stage frame, µm.
    async fn move_chuck(&self, delta: StageDelta) -> Result<()>;

    /// Lift the contacts off the wafer.
    async fn contacts_up(&self) -> Result<()>;

    /// Lower the contacts onto the wafer.
    async fn contacts_down(&self) -> Result<()>;
}

/// Opens instrument sessions by GPIB address.
#[async_trait]
pub trait InstrumentConnector: Send + Sync {
    /// Open the parameter analyzer.
    async fn connect_analyzer(&self, gpib_address: u8) -> Result<Arc<dyn ParameterAnalyzer>>;

    /// Open the probe station.
    async fn connect_probe_station(&self, gpib_address: u8) -> Result<Arc<dyn ProbeStation>>;
}

/// VISA resource string for a primary GPIB address on board 0.
pub fn gpib_resource(address: u8) -> String {
    format!("GPIB0::{address}::INSTR")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpib_resource() {
        assert_eq!(gpib_resource(16), "GPIB0::16::INSTR");
    }
}
