//! Simulated instruments for running without hardware.
//!
//! All simulated devices use async-safe delays (`tokio::time::sleep`).
//!
//! # Available Simulators
//!
//! - `SimulatedAnalyzer` - synthetic FET-like I-V data, with fault injection
//! - `MockProbeStation` - records chuck moves and contact state
//! - `SimulatedConnector` - hands out the two above, optionally failing
//!
//! Every device keeps a command log so tests can assert exactly what the run
//! engine asked for, and in which order.

use super::{InstrumentConnector, ParameterAnalyzer, ProbeStation};
use crate::program::{StepPlan, SweepStep};
use crate::wafer::StageDelta;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Callback invoked after each executed step with the 1-based step count.
pub type StepHook = Arc<dyn Fn(usize) + Send + Sync>;

// =============================================================================
// SimulatedAnalyzer
// =============================================================================

/// Command received by the simulated analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerCommand {
    /// `identify`
    Identify,
    /// `reset`
    Reset,
    /// `execute_step` with the step name
    ExecuteStep(String),
    /// `zero_outputs`
    ZeroOutputs,
    /// `close_channels`
    CloseChannels,
}

#[derive(Default)]
struct AnalyzerState {
    log: Vec<AnalyzerCommand>,
    steps_executed: usize,
}

/// Parameter analyzer producing synthetic currents.
///
/// For a step with index `b`, direction slot `d` and swept voltage `v`:
///
/// ```text
/// i_d = 1e-6 + 1e-6 * (|v| + 0.25 d) * (b + 1)
/// i_s = -i_d
/// i_g = 1e-9 + 1e-9 * |v| * (b + 1)
/// ```
#[derive(Clone)]
pub struct SimulatedAnalyzer {
    idn: String,
    step_delay: Duration,
    fail_at_step: Option<usize>,
    step_hook: Option<StepHook>,
    state: Arc<Mutex<AnalyzerState>>,
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAnalyzer {
    /// Analyzer with no delay and no injected faults.
    pub fn new() -> Self {
        Self {
            idn: "Agilent Technologies,B1500A,0,A.06.01.2019.0418 (simulated)".to_string(),
            step_delay: Duration::ZERO,
            fail_at_step: None,
            step_hook: None,
            state: Arc::new(Mutex::new(AnalyzerState::default())),
        }
    }

    /// Sleep this long inside every `execute_step`.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail the `n`th `execute_step` call (1-based, counted across the whole run).
    pub fn with_failure_at_step(mut self, n: usize) -> Self {
        self.fail_at_step = Some(n);
        self
    }

    /// Call `hook` after every successful step.
    pub fn with_step_hook(mut self, hook: StepHook) -> Self {
        self.step_hook = Some(hook);
        self
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<AnalyzerCommand> {
        self.state.lock().log.clone()
    }

    /// Number of `execute_step` calls, failed ones included.
    pub fn steps_executed(&self) -> usize {
        self.state.lock().steps_executed
    }

    fn record(&self, command: AnalyzerCommand) {
        self.state.lock().log.push(command);
    }

    fn synthesize(plan: &StepPlan) -> SweepStep {
        let scale = (plan.index + 1) as f64;
        let directions = plan.direction_values();

        let mut step = SweepStep::new(plan.name.clone());
        let mut i_d = Vec::with_capacity(directions.len());
        let mut i_s = Vec::with_capacity(directions.len());
        let mut i_g = Vec::with_capacity(directions.len());
        for (d, values) in directions.iter().enumerate() {
            let drain: Vec<f64> = values
                .iter()
                .map(|v| 1e-6 + 1e-6 * (v.abs() + d as f64 * 0.25) * scale)
                .collect();
            i_s.push(drain.iter().map(|i| -i).collect());
            i_d.push(drain);
            i_g.push(values.iter().map(|v| 1e-9 + 1e-9 * v.abs() * scale).collect());
        }

        for (channel, &bias) in &plan.biases {
            let held = directions.iter().map(|v| vec![bias; v.len()]).collect();
            step.channels.insert(channel.clone(), held);
        }
        step.channels.insert(plan.sweep_channel.clone(), directions);
        step.with_channel("i_d", i_d)
            .with_channel("i_s", i_s)
            .with_channel("i_g", i_g)
    }
}

#[async_trait]
impl ParameterAnalyzer for SimulatedAnalyzer {
    async fn identify(&self) -> Result<String> {
        self.record(AnalyzerCommand::Identify);
        Ok(self.idn.clone())
    }

    async fn reset(&self) -> Result<()> {
        self.record(AnalyzerCommand::Reset);
        Ok(())
    }

    async fn execute_step(&self, plan: &StepPlan) -> Result<SweepStep> {
        let count = {
            let mut state = self.state.lock();
            state.log.push(AnalyzerCommand::ExecuteStep(plan.name.clone()));
            state.steps_executed += 1;
            state.steps_executed
        };

        if !self.step_delay.is_zero() {
            sleep(self.step_delay).await;
        }
        if self.fail_at_step == Some(count) {
            bail!("ERRX? returned +305,\"Excess current in HPSMU\" during step {count}");
        }

        let step = Self::synthesize(plan);
        if let Some(hook) = &self.step_hook {
            hook(count);
        }
        Ok(step)
    }

    async fn zero_outputs(&self) -> Result<()> {
        self.record(AnalyzerCommand::ZeroOutputs);
        Ok(())
    }

    async fn close_channels(&self) -> Result<()> {
        self.record(AnalyzerCommand::CloseChannels);
        Ok(())
    }
}

// =============================================================================
// MockProbeStation
// =============================================================================

/// Command received by the mock probe station.
#[derive(Debug, Clone, PartialEq)]
pub enum StationCommand {
    /// `identify`
    Identify,
    /// `move_chuck`
    MoveChuck(StageDelta),
    /// `contacts_up`
    ContactsUp,
    /// `contacts_down`
    ContactsDown,
}

#[derive(Default)]
struct StationState {
    log: Vec<StationCommand>,
    chuck: (f64, f64, f64),
    contacts_down: bool,
}

/// Probe station that tracks the accumulated chuck position.
#[derive(Clone, Default)]
pub struct MockProbeStation {
    state: Arc<Mutex<StationState>>,
}

impl MockProbeStation {
    /// Station at the origin with contacts up.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<StationCommand> {
        self.state.lock().log.clone()
    }

    /// Chuck moves received so far.
    pub fn moves(&self) -> Vec<StageDelta> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|c| match c {
                StationCommand::MoveChuck(delta) => Some(*delta),
                _ => None,
            })
            .collect()
    }

    /// Sum of every chuck move.
    pub fn chuck_position(&self) -> (f64, f64, f64) {
        self.state.lock().chuck
    }

    /// Whether the contacts are on the wafer.
    pub fn contacts_are_down(&self) -> bool {
        self.state.lock().contacts_down
    }
}

#[async_trait]
impl ProbeStation for MockProbeStation {
    async fn identify(&self) -> Result<String> {
        self.state.lock().log.push(StationCommand::Identify);
        Ok("Cascade Microtech,Summit 12000 (simulated)".to_string())
    }

    async fn move_chuck(&self, delta: StageDelta) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(StationCommand::MoveChuck(delta));
        state.chuck.0 += delta.dx;
        state.chuck.1 += delta.dy;
        state.chuck.2 += delta.dz;
        Ok(())
    }

    async fn contacts_up(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(StationCommand::ContactsUp);
        state.contacts_down = false;
        Ok(())
    }

    async fn contacts_down(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(StationCommand::ContactsDown);
        state.contacts_down = true;
        Ok(())
    }
}

// =============================================================================
// SimulatedConnector
// =============================================================================

/// Connector handing out shared simulated instruments.
#[derive(Clone)]
pub struct SimulatedConnector {
    analyzer: SimulatedAnalyzer,
    station: MockProbeStation,
    reachable: Arc<Mutex<Vec<u8>>>,
    connect_log: Arc<Mutex<Vec<u8>>>,
}

impl SimulatedConnector {
    /// Every GPIB address answers.
    pub fn new(analyzer: SimulatedAnalyzer, station: MockProbeStation) -> Self {
        Self {
            analyzer,
            station,
            reachable: Arc::new(Mutex::new((0..=30).collect())),
            connect_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Only the listed GPIB addresses answer.
    pub fn with_reachable(self, addresses: &[u8]) -> Self {
        *self.reachable.lock() = addresses.to_vec();
        self
    }

    /// Addresses connected to so far.
    pub fn connected_addresses(&self) -> Vec<u8> {
        self.connect_log.lock().clone()
    }

    fn open(&self, gpib_address: u8) -> Result<()> {
        self.connect_log.lock().push(gpib_address);
        if self.reachable.lock().contains(&gpib_address) {
            Ok(())
        } else {
            Err(anyhow!(
                "No listener at {}",
                super::gpib_resource(gpib_address)
            ))
        }
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new(SimulatedAnalyzer::new(), MockProbeStation::new())
    }
}

#[async_trait]
impl InstrumentConnector for SimulatedConnector {
    async fn connect_analyzer(&self, gpib_address: u8) -> Result<Arc<dyn ParameterAnalyzer>> {
        self.open(gpib_address)?;
        Ok(Arc::new(self.analyzer.clone()))
    }

    async fn connect_probe_station(&self, gpib_address: u8) -> Result<Arc<dyn ProbeStation>> {
        self.open(gpib_address)?;
        Ok(Arc::new(self.station.clone()))
    }
}
