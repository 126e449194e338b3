//! Controller: the single owner of instruments, user profiles and the sequencer.
//!
//! Every client request goes through [`Controller::handle`]. Run requests are
//! validated completely (user, data folder, programs, sweep, analyzer) before the
//! sequencer sees them; a rejected request publishes one `measurement_error`.
//! Instrument connect/disconnect and manual chuck moves are refused with
//! [`DaqError::Busy`] while a run owns the instruments.
//!
//! [`Controller::run`] turns the controller into an actor that processes
//! [`ControllerCommand`]s sequentially; [`ControllerHandle`] is its client.

use crate::config::{Settings, MAX_GPIB_ADDRESS};
use crate::data::{JsonResultWriter, ResultWriter};
use crate::error::{AppResult, DaqError};
use crate::events::{ControllerEvent, ProgressEmitter};
use crate::experiment::{
    InstrumentSet, MeasurementRun, ProgramSequencer, RunHandle, RunOutcome,
};
use crate::instrument::{InstrumentConnector, ParameterAnalyzer, ProbeStation};
use crate::messages::{
    parse_config_payload, ControllerCommand, ControllerInfo, ControllerReply, ControllerRequest,
    RunMeasurementRequest,
};
use crate::profile::{UserGlobalSettings, UserStore};
use crate::program::{ProgramConfig, ProgramRegistry};
use crate::sweep::{StartAddress, SweepKind, SweepSpec};
use crate::wafer::{WaferCalibration, WaferPositionStepper};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

const ANALYZER: &str = "B1500 parameter analyzer";
const STATION: &str = "Cascade probe station";

/// Owns instruments, profiles and the run sequencer.
pub struct Controller {
    settings: Settings,
    settings_path: Option<PathBuf>,
    calibration: WaferCalibration,
    registry: Arc<ProgramRegistry>,
    users: Arc<UserStore>,
    emitter: ProgressEmitter,
    sequencer: ProgramSequencer,
    connector: Arc<dyn InstrumentConnector>,
    analyzer: Option<Arc<dyn ParameterAnalyzer>>,
    station: Option<Arc<dyn ProbeStation>>,
    last_run: Option<RunHandle>,
    autosave: Option<JoinHandle<()>>,
}

impl Controller {
    /// Controller writing JSON results, with the calibration file from `settings` if any.
    pub fn new(settings: Settings, connector: Arc<dyn InstrumentConnector>) -> AppResult<Self> {
        settings.validate()?;
        let calibration = match &settings.calibration_file {
            Some(path) => WaferCalibration::load(path)?,
            None => WaferCalibration::default(),
        };
        let registry = Arc::new(ProgramRegistry::new());
        let users = Arc::new(UserStore::new(
            settings.application.users_dir.clone(),
            registry.clone(),
        ));
        let emitter = ProgressEmitter::from_config(&settings.events);
        let sequencer =
            ProgramSequencer::new(registry.clone(), emitter.clone(), Arc::new(JsonResultWriter::new()));

        info!(
            users = settings.users.len(),
            height_offsets = calibration.height_offset_table.len(),
            "controller initialized"
        );
        Ok(Self {
            settings,
            settings_path: None,
            calibration,
            registry,
            users,
            emitter,
            sequencer,
            connector,
            analyzer: None,
            station: None,
            last_run: None,
            autosave: None,
        })
    }

    /// Persist settings changes (GPIB addresses) to `path`.
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    /// Replace the result writer.
    pub fn with_result_writer(mut self, writer: Arc<dyn ResultWriter>) -> Self {
        self.sequencer = ProgramSequencer::new(self.registry.clone(), self.emitter.clone(), writer);
        self
    }

    /// Replace the wafer calibration.
    pub fn with_calibration(mut self, calibration: WaferCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Event publisher shared with the sequencer.
    pub fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    /// Run sequencer.
    pub fn sequencer(&self) -> &ProgramSequencer {
        &self.sequencer
    }

    /// User profile store.
    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    /// Whether the analyzer is connected.
    pub fn analyzer_connected(&self) -> bool {
        self.analyzer.is_some()
    }

    /// Whether the probe station is connected.
    pub fn station_connected(&self) -> bool {
        self.station.is_some()
    }

    /// Handle of the most recently started run.
    pub fn take_run_handle(&mut self) -> Option<RunHandle> {
        self.last_run.take()
    }

    /// Start the periodic user settings autosave.
    pub fn start_autosave(&mut self) {
        if self.autosave.is_none() {
            let period = Duration::from_secs(self.settings.application.autosave_interval_secs.max(1));
            self.autosave = Some(self.users.spawn_autosave(period));
        }
    }

    /// Dispatch a client request.
    pub async fn handle(&mut self, request: ControllerRequest) -> AppResult<ControllerReply> {
        match request {
            ControllerRequest::RunMeasurement(request) => {
                let run_id = self.run_measurement(*request).await?;
                Ok(ControllerReply::RunStarted { run_id })
            }
            ControllerRequest::CancelMeasurement {} => Ok(ControllerReply::CancelRequested {
                accepted: self.cancel_measurement(),
            }),
            ControllerRequest::ConnectB1500 { gpib_address } => {
                let idn = self.connect_b1500(gpib_address).await?;
                Ok(ControllerReply::Idn { idn })
            }
            ControllerRequest::DisconnectB1500 {} => {
                self.disconnect_b1500()?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::SetB1500GpibAddress { gpib_address } => {
                self.set_b1500_gpib_address(gpib_address)?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::ConnectCascade { gpib_address } => {
                let idn = self.connect_cascade(gpib_address).await?;
                Ok(ControllerReply::Idn { idn })
            }
            ControllerRequest::DisconnectCascade {} => {
                self.disconnect_cascade()?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::SetCascadeGpibAddress { gpib_address } => {
                self.set_cascade_gpib_address(gpib_address)?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::GetUserSettings { user } => {
                let settings = self.get_user_settings(&user).await?;
                Ok(ControllerReply::UserSettings { settings })
            }
            ControllerRequest::SetUserSetting {
                user,
                setting,
                value,
            } => {
                let settings = self.set_user_setting(&user, &setting, value).await?;
                Ok(ControllerReply::UserSettings { settings })
            }
            ControllerRequest::GetMeasurementProgramConfig {
                user,
                program,
                index,
            } => {
                let config = self
                    .get_measurement_program_config(&user, &program, index)
                    .await?;
                Ok(ControllerReply::Config { config })
            }
            ControllerRequest::SetMeasurementProgramConfig {
                user,
                program,
                config,
            } => {
                self.set_measurement_program_config(&user, &program, &config)
                    .await?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::GetMeasurementSweepConfig { user, sweep } => {
                let config = self.get_measurement_sweep_config(&user, &sweep).await?;
                Ok(ControllerReply::Config { config })
            }
            ControllerRequest::SetMeasurementSweepConfig {
                user,
                sweep,
                config,
            } => {
                self.set_measurement_sweep_config(&user, &sweep, &config)
                    .await?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::MoveChuckRelative { dx, dy } => {
                self.move_chuck_relative(&dx, &dy).await?;
                Ok(ControllerReply::Ack)
            }
            ControllerRequest::GetControllerInfo {} => Ok(ControllerReply::Info(self.info())),
        }
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Validate and start a run. Rejections are published as `measurement_error`.
    pub async fn run_measurement(&mut self, request: RunMeasurementRequest) -> AppResult<Uuid> {
        match self.start_run(request).await {
            Ok(run_id) => Ok(run_id),
            Err(e) => {
                warn!(error = %e, "run request rejected");
                self.emitter.emit_event(ControllerEvent::MeasurementError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn start_run(&mut self, request: RunMeasurementRequest) -> AppResult<Uuid> {
        self.check_user(&request.user)?;
        if self.sequencer.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        let analyzer = self
            .analyzer
            .clone()
            .ok_or_else(|| DaqError::NotConnected(ANALYZER.to_string()))?;
        if request.programs.is_empty() {
            return Err(DaqError::InvalidInput(
                "Run has no measurement programs".to_string(),
            ));
        }
        for program in &request.programs {
            self.registry.get(program)?;
        }
        let sweep_kind: SweepKind = request.sweep.parse()?;

        let user_settings = self.users.settings(&request.user).await?;
        let data_folder = if request.data_folder.trim().is_empty() {
            user_settings.data_folder.clone()
        } else {
            request.data_folder.clone()
        };
        if request.sweep_save_data && !is_dir(Path::new(&data_folder)).await {
            return Err(DaqError::MissingDataFolder(data_folder));
        }

        let mut programs = Vec::with_capacity(request.programs.len());
        for (i, name) in request.programs.iter().enumerate() {
            let payload = match request.program_configs.get(i) {
                Some(payload) => parse_config_payload(payload)?,
                None => serde_json::Value::Null,
            };
            let config = if payload.is_null() {
                self.users.program_config(&request.user, name).await?
            } else {
                payload
            };
            programs.push(ProgramConfig::new(name.as_str(), config));
        }
        let sweep_config = match parse_config_payload(&request.sweep_config)? {
            serde_json::Value::Null => self.users.sweep_config(&request.user, sweep_kind).await?,
            config => config,
        };

        let mut calibration = user_settings.calibration(&self.calibration);
        if let Some(v) = request.die_dx {
            calibration.die_size_x = v;
        }
        if let Some(v) = request.die_dy {
            calibration.die_size_y = v;
        }
        if let Some(v) = request.device_dx {
            calibration.device_pitch_x = v;
        }
        if let Some(v) = request.device_dy {
            calibration.device_pitch_y = v;
        }
        let start = StartAddress {
            die_x: request.initial_die_x,
            die_y: request.initial_die_y,
            device_row: request.device_row,
            device_col: request.device_col,
        };

        let run = MeasurementRun::new(
            request.user.as_str(),
            start,
            calibration,
            programs.clone(),
            SweepSpec {
                kind: sweep_kind,
                config: sweep_config.clone(),
            },
        )
        .with_data_folder(data_folder, request.sweep_save_data)
        .with_save_image(request.sweep_save_image)
        .with_invert_direction(self.settings.instruments.invert_direction);

        let handle = self.sequencer.start(
            run,
            InstrumentSet {
                analyzer,
                station: self.station.clone(),
            },
        )?;
        let run_id = handle.run_id();
        self.last_run = Some(handle);

        for program in &programs {
            if let Err(e) = self
                .users
                .set_program_config(&request.user, &program.name, &program.config)
                .await
            {
                warn!(program = %program.name, error = %e, "failed to store program config");
            }
        }
        if let Err(e) = self
            .users
            .set_sweep_config(&request.user, sweep_kind, &sweep_config)
            .await
        {
            warn!(sweep = %sweep_kind, error = %e, "failed to store sweep config");
        }
        Ok(run_id)
    }

    /// Ask the active run to stop. Returns `false` when no run is active.
    pub fn cancel_measurement(&self) -> bool {
        self.sequencer.cancel()
    }

    /// Wait for the most recently started run to finish.
    pub async fn wait_for_run(&mut self) -> Option<AppResult<RunOutcome>> {
        match self.last_run.take() {
            Some(handle) => Some(handle.wait().await),
            None => None,
        }
    }

    // ------------------------------------------------------------------------
    // Instruments
    // ------------------------------------------------------------------------

    fn ensure_idle(&self, instrument: &str) -> AppResult<()> {
        if self.sequencer.is_running() {
            return Err(DaqError::Busy(format!(
                "{instrument} is in use by a measurement run"
            )));
        }
        Ok(())
    }

    fn check_gpib_address(gpib_address: u8) -> AppResult<()> {
        if gpib_address > MAX_GPIB_ADDRESS {
            return Err(DaqError::InvalidInput(format!(
                "GPIB address {gpib_address} out of range 0-{MAX_GPIB_ADDRESS}"
            )));
        }
        Ok(())
    }

    /// Connect the parameter analyzer and publish its identification.
    pub async fn connect_b1500(&mut self, gpib_address: u8) -> AppResult<String> {
        self.ensure_idle(ANALYZER)?;
        Self::check_gpib_address(gpib_address)?;
        let analyzer = self
            .connector
            .connect_analyzer(gpib_address)
            .await
            .map_err(DaqError::instrument)?;
        let idn = analyzer.identify().await.map_err(DaqError::instrument)?;
        info!(gpib_address, %idn, "parameter analyzer connected");
        self.analyzer = Some(analyzer);
        self.emitter
            .emit_event(ControllerEvent::ConnectB1500Idn { idn: idn.clone() });
        Ok(idn)
    }

    /// Release the parameter analyzer.
    pub fn disconnect_b1500(&mut self) -> AppResult<()> {
        self.ensure_idle(ANALYZER)?;
        if self.analyzer.take().is_some() {
            info!("parameter analyzer disconnected");
        }
        self.emitter.emit_event(ControllerEvent::DisconnectB1500 {});
        Ok(())
    }

    /// Connect the probe station and publish its identification.
    pub async fn connect_cascade(&mut self, gpib_address: u8) -> AppResult<String> {
        self.ensure_idle(STATION)?;
        Self::check_gpib_address(gpib_address)?;
        let station = self
            .connector
            .connect_probe_station(gpib_address)
            .await
            .map_err(DaqError::instrument)?;
        let idn = station.identify().await.map_err(DaqError::instrument)?;
        info!(gpib_address, %idn, "probe station connected");
        self.station = Some(station);
        self.emitter
            .emit_event(ControllerEvent::ConnectCascadeIdn { idn: idn.clone() });
        Ok(idn)
    }

    /// Release the probe station.
    pub fn disconnect_cascade(&mut self) -> AppResult<()> {
        self.ensure_idle(STATION)?;
        if self.station.take().is_some() {
            info!("probe station disconnected");
        }
        self.emitter.emit_event(ControllerEvent::DisconnectCascade {});
        Ok(())
    }

    /// Change the analyzer address setting and save it.
    pub fn set_b1500_gpib_address(&mut self, gpib_address: u8) -> AppResult<()> {
        let mut next = self.settings.clone();
        next.instruments.gpib_b1500 = gpib_address;
        self.replace_settings(next)
    }

    /// Change the probe station address setting and save it.
    pub fn set_cascade_gpib_address(&mut self, gpib_address: u8) -> AppResult<()> {
        let mut next = self.settings.clone();
        next.instruments.gpib_cascade = gpib_address;
        self.replace_settings(next)
    }

    fn replace_settings(&mut self, next: Settings) -> AppResult<()> {
        next.validate()?;
        if let Some(path) = &self.settings_path {
            next.save_to(path)?;
            info!(path = %path.display(), "controller settings saved");
        }
        self.settings = next;
        Ok(())
    }

    /// Jog the chuck by `(dx, dy)` µm in the wafer frame.
    pub async fn move_chuck_relative(
        &self,
        dx: &serde_json::Value,
        dy: &serde_json::Value,
    ) -> AppResult<()> {
        let dx = parse_number("dx", dx)?;
        let dy = parse_number("dy", dy)?;
        let stepper = WaferPositionStepper::new(
            self.calibration.clone(),
            self.settings.instruments.invert_direction,
        );
        let delta = stepper.move_relative(dx, dy)?;
        let station = self
            .station
            .clone()
            .ok_or_else(|| DaqError::NotConnected(STATION.to_string()))?;
        self.ensure_idle(STATION)?;
        station.move_chuck(delta).await.map_err(DaqError::instrument)
    }

    // ------------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------------

    fn check_user(&self, user: &str) -> AppResult<()> {
        if self.settings.users.iter().any(|u| u == user) {
            Ok(())
        } else {
            Err(DaqError::UnknownUser(user.to_string()))
        }
    }

    /// Load a user's settings and publish them.
    pub async fn get_user_settings(&self, user: &str) -> AppResult<UserGlobalSettings> {
        self.check_user(user)?;
        let settings = self.users.settings(user).await?;
        self.emitter.emit_event(ControllerEvent::SetUserSettings {
            settings: serde_json::to_value(&settings)?,
        });
        Ok(settings)
    }

    /// Change one of a user's settings.
    pub async fn set_user_setting(
        &self,
        user: &str,
        setting: &str,
        value: serde_json::Value,
    ) -> AppResult<UserGlobalSettings> {
        self.check_user(user)?;
        self.users.set_setting(user, setting, value).await
    }

    /// Load a user's program config and publish it.
    pub async fn get_measurement_program_config(
        &self,
        user: &str,
        program: &str,
        index: usize,
    ) -> AppResult<serde_json::Value> {
        self.check_user(user)?;
        let config = self.users.program_config(user, program).await?;
        self.emitter
            .emit_event(ControllerEvent::MeasurementProgramConfig {
                name: program.to_string(),
                index,
                config: config.clone(),
            });
        Ok(config)
    }

    /// Store a user's program config.
    pub async fn set_measurement_program_config(
        &self,
        user: &str,
        program: &str,
        config: &serde_json::Value,
    ) -> AppResult<()> {
        self.check_user(user)?;
        let config = require_object(parse_config_payload(config)?)?;
        self.users.set_program_config(user, program, &config).await?;
        Ok(())
    }

    /// Load a user's sweep config and publish it.
    pub async fn get_measurement_sweep_config(
        &self,
        user: &str,
        sweep: &str,
    ) -> AppResult<serde_json::Value> {
        self.check_user(user)?;
        let kind: SweepKind = sweep.parse()?;
        let config = self.users.sweep_config(user, kind).await?;
        self.emitter
            .emit_event(ControllerEvent::MeasurementSweepConfig {
                name: kind.to_string(),
                config: config.clone(),
            });
        Ok(config)
    }

    /// Store a user's sweep config.
    pub async fn set_measurement_sweep_config(
        &self,
        user: &str,
        sweep: &str,
        config: &serde_json::Value,
    ) -> AppResult<()> {
        self.check_user(user)?;
        let kind: SweepKind = sweep.parse()?;
        let config = require_object(parse_config_payload(config)?)?;
        self.users.set_sweep_config(user, kind, &config).await?;
        Ok(())
    }

    /// Settings summary with the available programs and sweeps.
    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            gpib_b1500: self.settings.instruments.gpib_b1500,
            gpib_cascade: self.settings.instruments.gpib_cascade,
            users: self.settings.users.clone(),
            programs: self.registry.names().into_iter().map(String::from).collect(),
            sweeps: SweepKind::ALL.iter().map(|k| k.to_string()).collect(),
            running: self.sequencer.is_running(),
        }
    }

    // ------------------------------------------------------------------------
    // Actor
    // ------------------------------------------------------------------------

    /// Cancel any active run, wait for it, then flush dirty user settings.
    pub async fn shutdown(&mut self) {
        if self.sequencer.cancel() {
            info!("cancelling active run for shutdown");
        }
        if let Some(Err(e)) = self.wait_for_run().await {
            warn!(error = %e, "active run ended abnormally during shutdown");
        }
        if let Some(task) = self.autosave.take() {
            task.abort();
        }
        if let Err(e) = self.users.save_dirty().await {
            warn!(error = %e, "failed to save user settings on shutdown");
        }
    }

    /// Process commands until shutdown or until every sender is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ControllerCommand>) {
        info!("controller started");

        while let Some(command) = command_rx.recv().await {
            match command {
                ControllerCommand::Request { request, response } => {
                    let result = self.handle(request).await;
                    let _ = response.send(result);
                }

                ControllerCommand::Shutdown { response } => {
                    info!("shutdown command received");
                    self.shutdown().await;
                    let _ = response.send(());
                    return;
                }
            }
        }

        self.shutdown().await;
        info!("controller stopped");
    }

    /// Spawn the actor loop.
    pub fn spawn(self, capacity: usize) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (ControllerHandle { tx }, task)
    }
}

/// Client side of the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    /// Send a request and wait for its reply.
    pub async fn request(&self, request: ControllerRequest) -> AppResult<ControllerReply> {
        let (command, rx) = ControllerCommand::request(request);
        self.tx
            .send(command)
            .await
            .map_err(|_| DaqError::Task("controller is not running".to_string()))?;
        rx.await
            .map_err(|_| DaqError::Task("controller dropped the request".to_string()))?
    }

    /// Stop the actor after cancelling any run.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, rx) = ControllerCommand::shutdown();
        self.tx
            .send(command)
            .await
            .map_err(|_| DaqError::Task("controller is not running".to_string()))?;
        rx.await
            .map_err(|_| DaqError::Task("controller stopped before acknowledging".to_string()))
    }
}

async fn is_dir(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn parse_number(name: &str, value: &serde_json::Value) -> AppResult<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| DaqError::InvalidInput(format!("{name} must be a number, got {value}")))
}

fn require_object(config: serde_json::Value) -> AppResult<serde_json::Value> {
    if config.is_object() {
        Ok(config)
    } else {
        Err(DaqError::InvalidInput(format!(
            "Config must be an object, got {config}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::SimulatedConnector;
    use serde_json::json;
    use tracing_test::traced_test;

    fn controller(dir: &Path) -> Controller {
        let mut settings = Settings::default();
        settings.application.users_dir = dir.to_path_buf();
        Controller::new(settings, Arc::new(SimulatedConnector::default())).unwrap()
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("dx", &json!(1.5)).unwrap(), 1.5);
        assert_eq!(parse_number("dx", &json!(" -20 ")).unwrap(), -20.0);
        assert!(parse_number("dx", &json!("left")).is_err());
        assert!(parse_number("dx", &json!(null)).is_err());
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path());
        let err = ctrl.get_user_settings("mallory").await.unwrap_err();
        assert!(matches!(err, DaqError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn test_gpib_setting_validated_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wafer_daq.toml");
        let mut ctrl = controller(dir.path()).with_settings_path(&path);

        assert!(ctrl.set_b1500_gpib_address(31).is_err());
        assert!(ctrl.set_b1500_gpib_address(22).is_err());
        ctrl.set_b1500_gpib_address(17).unwrap();
        assert_eq!(ctrl.settings().instruments.gpib_b1500, 17);

        let reloaded = Settings::load_from(&path).unwrap();
        assert_eq!(reloaded.instruments.gpib_b1500, 17);
    }

    #[tokio::test]
    async fn test_move_chuck_requires_station() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(dir.path());
        let err = ctrl
            .move_chuck_relative(&json!(10), &json!(0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::NotConnected(_)));

        let err = ctrl
            .move_chuck_relative(&json!("NaN"), &json!(0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidInput(_)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_run_is_logged_and_published() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(dir.path());
        let mut events = ctrl.emitter().subscribe();
        let request = RunMeasurementRequest {
            user: "public".to_string(),
            initial_die_x: 0,
            initial_die_y: 0,
            die_dx: None,
            die_dy: None,
            device_row: 0,
            device_col: 0,
            device_dx: None,
            device_dy: None,
            data_folder: String::new(),
            programs: vec!["debug".to_string()],
            program_configs: Vec::new(),
            sweep: "single".to_string(),
            sweep_config: serde_json::Value::Null,
            sweep_save_data: false,
            sweep_save_image: false,
        };

        let err = ctrl.run_measurement(request).await.unwrap_err();
        assert!(matches!(err, DaqError::NotConnected(_)));
        let event = events.try_recv().unwrap();
        assert_eq!(event.msg, "measurement_error");
        assert!(logs_contain("run request rejected"));
    }

    #[tokio::test]
    async fn test_info_lists_programs_and_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let info = controller(dir.path()).info();
        assert!(info.programs.contains(&"keysight_id_vgs".to_string()));
        assert_eq!(info.sweeps, vec!["single", "array", "list"]);
        assert!(!info.running);
    }
}
