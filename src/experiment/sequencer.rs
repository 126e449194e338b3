//! Run state machine: targets x programs x steps.
//!
//! ```text
//! Idle -> Connecting -> Running(program, step) -> Completed
//!                            |      ^                Failed
//!                            v      |                Cancelled
//!                         Paused(cancel requested) --^
//! ```
//!
//! A run is validated and fully planned before any instrument command is sent.
//! Exactly one run owns the instruments at a time: the sequencer holds a single
//! active-run slot, taken in [`ProgramSequencer::start`] and released only on a
//! terminal transition. The run itself is one tokio task that awaits instrument
//! I/O serially and polls the cancellation flag before the first step and after
//! every completed step.

use super::cancel::CancellationController;
use super::run::{MeasurementRun, SweepMetadata};
use crate::data::{ResultDataset, ResultWriter, SweepResultBuffer};
use crate::error::{AppResult, DaqError};
use crate::events::{
    ControllerEvent, FinishStatus, ProgressEmitter, ProgressMetadata, ProgressUpdate,
};
use crate::instrument::{ParameterAnalyzer, ProbeStation};
use crate::program::{ProgramRegistry, ResultShape, StepPlan};
use crate::sweep::Target;
use crate::wafer::{Position, WaferPositionStepper};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run engine state, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    /// No run has started yet
    Idle,
    /// Acquiring and resetting instruments
    Connecting,
    /// Executing `step` of `program` (indices into the chain and its plan)
    Running {
        /// Program index
        program: usize,
        /// Step index
        step: usize,
    },
    /// Cancel requested; the run stops at the next checkpoint
    Paused {
        /// Program index
        program: usize,
        /// Step index
        step: usize,
    },
    /// Every target and program finished
    Completed,
    /// Aborted by an error
    Failed {
        /// Error message
        error: String,
    },
    /// Stopped at a checkpoint after a cancel request
    Cancelled,
}

impl EngineState {
    /// Connecting, Running or Paused.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Connecting | EngineState::Running { .. } | EngineState::Paused { .. }
        )
    }

    /// Completed, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Failed { .. } | EngineState::Cancelled
        )
    }
}

/// Instruments lent to one run.
#[derive(Clone)]
pub struct InstrumentSet {
    /// Parameter analyzer, required
    pub analyzer: Arc<dyn ParameterAnalyzer>,
    /// Probe station; without it the run measures in place
    pub station: Option<Arc<dyn ProbeStation>>,
}

/// Dataset of one program at one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramResult {
    /// Target index in the run
    pub target: usize,
    /// Program index in the chain
    pub program_index: usize,
    /// Program tag
    pub program: String,
    /// Padded dataset, partial if the run stopped early
    pub dataset: ResultDataset,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Run identity
    pub run_id: Uuid,
    /// Terminal status
    pub status: FinishStatus,
    /// Error message when `status` is `Error`
    pub error: Option<String>,
    /// Datasets in completion order
    pub results: Vec<ProgramResult>,
}

/// Handle to a started run.
pub struct RunHandle {
    run_id: Uuid,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Run identity.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> AppResult<RunOutcome> {
        self.join
            .await
            .map_err(|e| DaqError::Task(format!("run {} did not complete: {e}", self.run_id)))
    }
}

/// Clears the active-run slot and the cancel flag, even if the run task panics.
struct ActiveRunGuard {
    slot: Arc<Mutex<Option<Uuid>>>,
    cancel: CancellationController,
    released: bool,
}

impl ActiveRunGuard {
    fn release(&mut self) {
        if !self.released {
            self.cancel.disarm();
            *self.slot.lock() = None;
            self.released = true;
        }
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Executes measurement runs, one at a time.
#[derive(Clone)]
pub struct ProgramSequencer {
    registry: Arc<ProgramRegistry>,
    emitter: ProgressEmitter,
    writer: Arc<dyn ResultWriter>,
    cancel: CancellationController,
    state_tx: Arc<watch::Sender<EngineState>>,
    active: Arc<Mutex<Option<Uuid>>>,
}

impl ProgramSequencer {
    /// Idle sequencer.
    pub fn new(
        registry: Arc<ProgramRegistry>,
        emitter: ProgressEmitter,
        writer: Arc<dyn ResultWriter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        Self {
            registry,
            emitter,
            writer,
            cancel: CancellationController::new(),
            state_tx: Arc::new(state_tx),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared cancellation flag.
    pub fn cancellation(&self) -> CancellationController {
        self.cancel.clone()
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state_tx.borrow().clone()
    }

    /// Watch engine state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Id of the run holding the instruments, if any.
    pub fn active_run(&self) -> Option<Uuid> {
        *self.active.lock()
    }

    /// Whether a run holds the instruments.
    pub fn is_running(&self) -> bool {
        self.active_run().is_some()
    }

    /// Request cancellation of the active run. Returns `false` without an active run.
    pub fn cancel(&self) -> bool {
        if !self.cancel.request_cancel() {
            return false;
        }
        self.state_tx.send_if_modified(|state| match *state {
            EngineState::Running { program, step } => {
                *state = EngineState::Paused { program, step };
                true
            }
            _ => false,
        });
        true
    }

    /// Validate, plan and start a run.
    ///
    /// Fails with `AlreadyRunning` while another run is active, and with an input
    /// error if the sweep or any program config is invalid. In both cases no
    /// instrument command is issued and no state changes.
    pub fn start(&self, run: MeasurementRun, instruments: InstrumentSet) -> AppResult<RunHandle> {
        if self.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        let plan = self.plan(&run)?;

        {
            let mut slot = self.active.lock();
            if slot.is_some() {
                return Err(DaqError::AlreadyRunning);
            }
            *slot = Some(run.id);
        }
        self.cancel.arm();
        self.state_tx.send_replace(EngineState::Connecting);

        let guard = ActiveRunGuard {
            slot: self.active.clone(),
            cancel: self.cancel.clone(),
            released: false,
        };
        let run_id = run.id;
        info!(
            %run_id,
            user = %run.user,
            targets = plan.targets.len(),
            programs = run.programs.len(),
            "measurement run started"
        );

        let task = RunTask {
            run,
            plan,
            instruments,
            emitter: self.emitter.clone(),
            writer: self.writer.clone(),
            cancel: self.cancel.clone(),
            state_tx: self.state_tx.clone(),
            results: Vec::new(),
        };
        let join = tokio::spawn(task.execute(guard));
        Ok(RunHandle { run_id, join })
    }

    fn plan(&self, run: &MeasurementRun) -> AppResult<RunPlan> {
        if run.programs.is_empty() {
            return Err(DaqError::InvalidInput(
                "Run has no measurement programs".to_string(),
            ));
        }
        run.calibration.validate()?;
        let targets = run.sweep.targets(&run.start)?;
        let programs = run
            .programs
            .iter()
            .map(|program| {
                let entry = self.registry.get(&program.name)?;
                let steps = self.registry.plan(&program.name, &program.config)?;
                Ok(PlannedProgram {
                    shape: entry.shape,
                    steps,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(RunPlan { targets, programs })
    }
}

struct PlannedProgram {
    shape: ResultShape,
    steps: Vec<StepPlan>,
}

struct RunPlan {
    targets: Vec<Target>,
    programs: Vec<PlannedProgram>,
}

enum Stop {
    Cancelled,
    Failed(DaqError),
}

struct RunTask {
    run: MeasurementRun,
    plan: RunPlan,
    instruments: InstrumentSet,
    emitter: ProgressEmitter,
    writer: Arc<dyn ResultWriter>,
    cancel: CancellationController,
    state_tx: Arc<watch::Sender<EngineState>>,
    results: Vec<ProgramResult>,
}

impl RunTask {
    async fn execute(mut self, mut guard: ActiveRunGuard) -> RunOutcome {
        let run_id = self.run.id;
        // A run cancelled before it starts never touches the analyzer state.
        let stop = match self.checkpoint() {
            Err(stop) => Some(stop),
            Ok(()) => match self.connect().await {
                Ok(()) => self.run_targets().await.err(),
                Err(e) => Some(Stop::Failed(e)),
            },
        };

        let (status, error, state) = match stop {
            None => (FinishStatus::Success, None, EngineState::Completed),
            Some(Stop::Cancelled) => (FinishStatus::Cancelled, None, EngineState::Cancelled),
            Some(Stop::Failed(err)) => {
                let message = err.to_string();
                error!(%run_id, error = %message, "measurement run failed");
                if let Err(e) = self.instruments.analyzer.zero_outputs().await {
                    warn!(%run_id, error = %e, "failed to zero analyzer outputs");
                }
                self.emitter.emit_event(ControllerEvent::MeasurementError {
                    error: message.clone(),
                });
                (
                    FinishStatus::Error,
                    Some(message.clone()),
                    EngineState::Failed { error: message },
                )
            }
        };

        if let Err(e) = self.instruments.analyzer.close_channels().await {
            warn!(%run_id, error = %e, "failed to close analyzer channels");
        }

        self.state_tx.send_replace(state);
        guard.release();
        self.emitter
            .emit_event(ControllerEvent::MeasurementFinish { status });
        info!(%run_id, ?status, datasets = self.results.len(), "measurement run finished");

        RunOutcome {
            run_id,
            status,
            error,
            results: self.results,
        }
    }

    async fn connect(&self) -> AppResult<()> {
        let idn = self
            .instruments
            .analyzer
            .identify()
            .await
            .map_err(DaqError::instrument)?;
        debug!(run_id = %self.run.id, %idn, "analyzer acquired");
        self.instruments
            .analyzer
            .reset()
            .await
            .map_err(DaqError::instrument)
    }

    fn checkpoint(&self) -> Result<(), Stop> {
        if self.cancel.is_cancel_requested() {
            info!(run_id = %self.run.id, "run cancelled at checkpoint");
            return Err(Stop::Cancelled);
        }
        Ok(())
    }

    fn set_step(&self, program: usize, step: usize) {
        let state = if self.cancel.is_cancel_requested() {
            EngineState::Paused { program, step }
        } else {
            EngineState::Running { program, step }
        };
        self.state_tx.send_replace(state);
    }

    async fn run_targets(&mut self) -> Result<(), Stop> {
        let stepper =
            WaferPositionStepper::new(self.run.calibration.clone(), self.run.invert_direction);
        let start = self.run.start;
        let mut current = stepper.position(
            start.die_x,
            start.die_y,
            start.device_row,
            start.device_col,
        );

        self.set_step(0, 0);
        self.checkpoint()?;

        let targets = self.plan.targets.clone();
        let num_programs = self.plan.programs.len();
        for (target_number, target) in targets.iter().enumerate() {
            let mut position = stepper.position(
                target.die_x,
                target.die_y,
                target.device_row,
                target.device_col,
            );
            position.x += target.offset_x;
            position.y += target.offset_y;

            self.move_to(&stepper, &current, &position)
                .await
                .map_err(Stop::Failed)?;
            current = position;

            let metadata = SweepMetadata::for_target(&self.run, target, position);
            if self.run.save_data {
                self.writer
                    .write_metadata(&metadata)
                    .await
                    .map_err(|e| Stop::Failed(DaqError::Storage(format!("{e:#}"))))?;
            }
            info!(
                run_id = %self.run.id,
                target = %target.label,
                die_x = target.die_x,
                die_y = target.die_y,
                "measuring target"
            );

            let last_target = target_number + 1 == targets.len();
            for program_index in 0..num_programs {
                let last_program = last_target && program_index + 1 == num_programs;
                self.run_program(target, &metadata, program_index, last_program)
                    .await?;
            }
        }
        Ok(())
    }

    async fn move_to(
        &self,
        stepper: &WaferPositionStepper,
        from: &Position,
        to: &Position,
    ) -> AppResult<()> {
        let Some(station) = &self.instruments.station else {
            return Ok(());
        };
        let delta = stepper.delta_between(from, to);
        if from.same_die(to) {
            if !delta.is_zero() {
                station.move_chuck(delta).await.map_err(DaqError::instrument)?;
            }
            return Ok(());
        }

        debug!(
            die_x = to.die_x,
            die_y = to.die_y,
            dx = delta.dx,
            dy = delta.dy,
            dz = delta.dz,
            "moving to die"
        );
        station.contacts_up().await.map_err(DaqError::instrument)?;
        station.move_chuck(delta).await.map_err(DaqError::instrument)?;
        station.contacts_down().await.map_err(DaqError::instrument)
    }

    async fn run_program(
        &mut self,
        target: &Target,
        metadata: &SweepMetadata,
        program_index: usize,
        last_program: bool,
    ) -> Result<(), Stop> {
        let program = self.run.programs[program_index].clone();
        let planned = &self.plan.programs[program_index];
        let steps = planned.steps.clone();
        let mut buffer = SweepResultBuffer::new(program.name.clone(), planned.shape.channels);
        let metadata_value = serde_json::to_value(metadata).unwrap_or(serde_json::Value::Null);

        info!(
            run_id = %self.run.id,
            program = %program.name,
            steps = steps.len(),
            "running program"
        );

        let mut outcome = Ok(());
        for plan in &steps {
            self.set_step(program_index, plan.index);
            let step = match self.instruments.analyzer.execute_step(plan).await {
                Ok(step) => step,
                Err(e) => return Err(Stop::Failed(DaqError::instrument(e))),
            };
            buffer.push(step);

            let update = ProgressUpdate {
                metadata: ProgressMetadata {
                    program: program.name.clone(),
                    config: metadata_value.clone(),
                    step: plan.index,
                    step_total: steps.len(),
                },
                data: buffer.snapshot(),
            };
            self.emitter.emit_progress(&update);

            // Nothing is left to skip after the run's final step.
            let run_done = last_program && plan.index + 1 == steps.len();
            if run_done {
                break;
            }
            if let Err(stop) = self.checkpoint() {
                outcome = Err(stop);
                break;
            }
        }

        let dataset = buffer.snapshot();
        if self.run.save_data && !buffer.is_empty() {
            self.writer
                .write_dataset(metadata, program_index, &program, &dataset)
                .await
                .map_err(|e| Stop::Failed(DaqError::Storage(format!("{e:#}"))))?;
        }
        self.results.push(ProgramResult {
            target: target.index,
            program_index,
            program: program.name,
            dataset,
        });
        outcome
    }
}
