//! Command channel types.
//!
//! Clients send [`ControllerRequest`]s as JSON `{msg, data}` objects, the same
//! envelope the event stream uses. Inside the process, requests travel to the
//! controller actor as [`ControllerCommand`]s carrying a oneshot reply channel.

use crate::error::{AppResult, DaqError};
use crate::profile::UserGlobalSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Parameters of a `run_measurement` request.
///
/// Program and sweep configs may arrive either as JSON objects or as strings
/// holding JSON; see [`parse_config_payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeasurementRequest {
    /// Requesting user
    pub user: String,
    /// Start die x
    #[serde(default, alias = "current_die_x")]
    pub initial_die_x: i32,
    /// Start die y
    #[serde(default, alias = "current_die_y")]
    pub initial_die_y: i32,
    /// Die pitch along x; the user's setting when absent
    #[serde(default)]
    pub die_dx: Option<f64>,
    /// Die pitch along y; the user's setting when absent
    #[serde(default)]
    pub die_dy: Option<f64>,
    /// Start device row
    #[serde(default)]
    pub device_row: i32,
    /// Start device column
    #[serde(default)]
    pub device_col: i32,
    /// Device pitch along x; the user's setting when absent
    #[serde(default)]
    pub device_dx: Option<f64>,
    /// Device pitch along y; the user's setting when absent
    #[serde(default)]
    pub device_dy: Option<f64>,
    /// Root folder for results; the user's setting when empty
    #[serde(default)]
    pub data_folder: String,
    /// Program chain
    #[serde(default)]
    pub programs: Vec<String>,
    /// Config per program; missing entries use the user's stored config
    #[serde(default)]
    pub program_configs: Vec<serde_json::Value>,
    /// Sweep tag
    pub sweep: String,
    /// Sweep config; the user's stored config when null
    #[serde(default)]
    pub sweep_config: serde_json::Value,
    /// Persist datasets
    #[serde(default)]
    pub sweep_save_data: bool,
    /// Render plots of datasets
    #[serde(default)]
    pub sweep_save_image: bool,
}

/// Requests accepted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data", rename_all = "snake_case")]
pub enum ControllerRequest {
    /// Start a measurement run
    RunMeasurement(Box<RunMeasurementRequest>),
    /// Stop the active run at its next checkpoint
    CancelMeasurement {},
    /// Connect the parameter analyzer
    ConnectB1500 {
        /// GPIB address
        gpib_address: u8,
    },
    /// Release the parameter analyzer
    DisconnectB1500 {},
    /// Change and persist the analyzer address setting
    SetB1500GpibAddress {
        /// GPIB address
        gpib_address: u8,
    },
    /// Connect the probe station
    ConnectCascade {
        /// GPIB address
        gpib_address: u8,
    },
    /// Release the probe station
    DisconnectCascade {},
    /// Change and persist the probe station address setting
    SetCascadeGpibAddress {
        /// GPIB address
        gpib_address: u8,
    },
    /// Publish a user's global settings
    GetUserSettings {
        /// User name
        user: String,
    },
    /// Change one global setting of a user
    SetUserSetting {
        /// User name
        user: String,
        /// Field name
        setting: String,
        /// New value
        value: serde_json::Value,
    },
    /// Publish a user's stored program config
    GetMeasurementProgramConfig {
        /// User name
        user: String,
        /// Program tag
        program: String,
        /// Slot in the client's program chain, echoed back
        #[serde(default)]
        index: usize,
    },
    /// Store a user's program config
    SetMeasurementProgramConfig {
        /// User name
        user: String,
        /// Program tag
        program: String,
        /// Config object or JSON string
        config: serde_json::Value,
    },
    /// Publish a user's stored sweep config
    GetMeasurementSweepConfig {
        /// User name
        user: String,
        /// Sweep tag
        sweep: String,
    },
    /// Store a user's sweep config
    SetMeasurementSweepConfig {
        /// User name
        user: String,
        /// Sweep tag
        sweep: String,
        /// Config object or JSON string
        config: serde_json::Value,
    },
    /// Jog the chuck relative to its current position
    MoveChuckRelative {
        /// Numbers or numeric strings
        dx: serde_json::Value,
        /// Numbers or numeric strings
        dy: serde_json::Value,
    },
    /// Controller settings and available programs and sweeps
    GetControllerInfo {},
}

impl ControllerRequest {
    /// Parse a `{msg, data}` request. A missing `data` is read as `{}`.
    pub fn from_json(mut value: serde_json::Value) -> AppResult<Self> {
        if let serde_json::Value::Object(map) = &mut value {
            map.entry("data")
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
        serde_json::from_value(value)
            .map_err(|e| DaqError::InvalidInput(format!("Malformed request: {e}")))
    }

    /// Parse request text.
    pub fn from_str_json(text: &str) -> AppResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| DaqError::InvalidInput(format!("Malformed request: {e}")))?;
        Self::from_json(value)
    }
}

/// Config payloads may be JSON objects or strings containing JSON.
pub fn parse_config_payload(payload: &serde_json::Value) -> AppResult<serde_json::Value> {
    match payload {
        serde_json::Value::String(text) => serde_json::from_str(text)
            .map_err(|e| DaqError::InvalidInput(format!("Invalid config JSON: {e}"))),
        serde_json::Value::Object(_) | serde_json::Value::Null => Ok(payload.clone()),
        other => Err(DaqError::InvalidInput(format!(
            "Config must be an object, got {other}"
        ))),
    }
}

/// Controller settings and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerInfo {
    /// Analyzer address setting
    pub gpib_b1500: u8,
    /// Probe station address setting
    pub gpib_cascade: u8,
    /// Known users
    pub users: Vec<String>,
    /// Program tags
    pub programs: Vec<String>,
    /// Sweep tags
    pub sweeps: Vec<String>,
    /// Whether a run holds the instruments
    pub running: bool,
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum ControllerReply {
    /// Done, nothing to return
    Ack,
    /// A run was started
    RunStarted {
        /// Run identity
        run_id: Uuid,
    },
    /// Cancel was requested; `false` when no run was active
    CancelRequested {
        /// Whether a run will stop
        accepted: bool,
    },
    /// Instrument identification after connect
    Idn {
        /// Identification string
        idn: String,
    },
    /// A user's global settings
    UserSettings {
        /// Settings
        settings: UserGlobalSettings,
    },
    /// A stored program or sweep config
    Config {
        /// Config object
        config: serde_json::Value,
    },
    /// Controller info
    Info(ControllerInfo),
}

/// Message to the controller actor.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Handle a client request
    Request {
        /// The request
        request: ControllerRequest,
        /// Reply channel
        response: oneshot::Sender<AppResult<ControllerReply>>,
    },

    /// Cancel any run, flush user settings and stop the actor
    Shutdown {
        /// Signalled once the actor has stopped
        response: oneshot::Sender<()>,
    },
}

impl ControllerCommand {
    /// Helper to create a Request command
    pub fn request(
        request: ControllerRequest,
    ) -> (Self, oneshot::Receiver<AppResult<ControllerReply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Request {
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_run_request() {
        let request = ControllerRequest::from_json(json!({
            "msg": "run_measurement",
            "data": {
                "user": "public",
                "initial_die_x": 1,
                "initial_die_y": -2,
                "programs": ["keysight_id_vgs"],
                "program_configs": ["{\"v_ds\": [0.05]}"],
                "sweep": "single",
                "sweep_save_data": false
            }
        }))
        .unwrap();

        let ControllerRequest::RunMeasurement(run) = request else {
            panic!("expected run_measurement");
        };
        assert_eq!(run.initial_die_y, -2);
        assert_eq!(run.die_dx, None);
        assert_eq!(
            parse_config_payload(&run.program_configs[0]).unwrap(),
            json!({"v_ds": [0.05]})
        );
    }

    #[test]
    fn test_missing_data_is_empty() {
        let request = ControllerRequest::from_json(json!({"msg": "cancel_measurement"})).unwrap();
        assert_eq!(request, ControllerRequest::CancelMeasurement {});
    }

    #[test]
    fn test_unknown_request_rejected() {
        let err = ControllerRequest::from_str_json(r#"{"msg": "launch", "data": {}}"#).unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_config_payload_rejects_scalars() {
        assert!(parse_config_payload(&json!(3)).is_err());
        assert!(parse_config_payload(&json!("{not json")).is_err());
    }

    #[test]
    fn test_reply_serialization() {
        let reply = ControllerReply::CancelRequested { accepted: true };
        assert_eq!(
            serde_json::to_value(reply).unwrap(),
            json!({"reply": "cancel_requested", "data": {"accepted": true}})
        );
    }
}
