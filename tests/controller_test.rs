//! Controller request handling with simulated instruments.
//!
//! Run with: cargo test --test controller_test

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wafer_daq::config::Settings;
use wafer_daq::events::{EventRecord, FinishStatus};
use wafer_daq::instrument::mock::{MockProbeStation, SimulatedAnalyzer, SimulatedConnector, StationCommand};
use wafer_daq::messages::{ControllerReply, ControllerRequest, RunMeasurementRequest};
use wafer_daq::wafer::StageDelta;
use wafer_daq::{Controller, DaqError};

struct Bench {
    controller: Controller,
    analyzer: SimulatedAnalyzer,
    station: MockProbeStation,
}

fn bench(users_dir: &Path, analyzer: SimulatedAnalyzer) -> Bench {
    let station = MockProbeStation::new();
    let mut settings = Settings::default();
    settings.users = vec!["public".to_string(), "alice".to_string()];
    settings.application.users_dir = users_dir.to_path_buf();
    let connector = Arc::new(SimulatedConnector::new(analyzer.clone(), station.clone()));
    Bench {
        controller: Controller::new(settings, connector).unwrap(),
        analyzer,
        station,
    }
}

fn request(user: &str, programs: &[&str], sweep: &str) -> RunMeasurementRequest {
    RunMeasurementRequest {
        user: user.to_string(),
        initial_die_x: 0,
        initial_die_y: 0,
        die_dx: None,
        die_dy: None,
        device_row: 0,
        device_col: 0,
        device_dx: None,
        device_dy: None,
        data_folder: String::new(),
        programs: programs.iter().map(|p| p.to_string()).collect(),
        program_configs: Vec::new(),
        sweep: sweep.to_string(),
        sweep_config: serde_json::Value::Null,
        sweep_save_data: false,
        sweep_save_image: false,
    }
}

fn errors(history: &[EventRecord]) -> Vec<String> {
    history
        .iter()
        .filter(|r| r.msg == "measurement_error")
        .map(|r| r.data["error"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_rejected_runs_publish_one_error_each() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = bench(dir.path(), SimulatedAnalyzer::new());

    // Analyzer not connected yet.
    let err = b
        .controller
        .run_measurement(request("public", &["debug"], "single"))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::NotConnected(_)));

    b.controller.connect_b1500(16).await.unwrap();

    let err = b
        .controller
        .run_measurement(request("mallory", &["debug"], "single"))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::UnknownUser(_)));

    let err = b
        .controller
        .run_measurement(request("public", &["keysight_cv"], "single"))
        .await
        .unwrap_err();
    assert!(err.is_input_error());

    let err = b
        .controller
        .run_measurement(request("public", &["debug"], "spiral"))
        .await
        .unwrap_err();
    assert!(err.is_input_error());

    let err = b
        .controller
        .run_measurement(request("public", &[], "single"))
        .await
        .unwrap_err();
    assert!(err.is_input_error());

    let mut save = request("public", &["debug"], "single");
    save.sweep_save_data = true;
    save.data_folder = dir.path().join("missing").display().to_string();
    let err = b.controller.run_measurement(save).await.unwrap_err();
    assert!(matches!(err, DaqError::MissingDataFolder(_)));

    let history = b.controller.emitter().events().history();
    assert_eq!(errors(&history).len(), 6);
    assert!(history.iter().all(|r| r.msg != "measurement_finish"));
    assert_eq!(b.analyzer.steps_executed(), 0);
    assert!(!b.controller.sequencer().is_running());
}

#[tokio::test]
async fn test_run_uses_stored_configs_and_saves_results() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let mut b = bench(dir.path(), SimulatedAnalyzer::new());
    b.controller.connect_b1500(16).await.unwrap();

    b.controller
        .set_measurement_program_config(
            "alice",
            "debug",
            &json!(r#"{"v_gs": [0.0, 1.0], "v_ds": [0.1, 0.2, 0.3]}"#),
        )
        .await
        .unwrap();
    b.controller
        .set_user_setting(
            "alice",
            "data_folder",
            json!(data_dir.path().display().to_string()),
        )
        .await
        .unwrap();

    let mut run = request("alice", &["debug"], "single");
    run.sweep_save_data = true;
    b.controller.run_measurement(run).await.unwrap();
    let outcome = b.controller.wait_for_run().await.unwrap().unwrap();

    assert_eq!(outcome.status, FinishStatus::Success);
    assert_eq!(b.analyzer.steps_executed(), 3);
    assert_eq!(outcome.results[0].dataset.shape(), (3, 2, 2));

    let die_dir = data_dir.path().join("die_x_0_y_0");
    assert_eq!(std::fs::read_dir(die_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn test_disconnect_refused_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = SimulatedAnalyzer::new().with_step_delay(Duration::from_millis(30));
    let mut b = bench(dir.path(), analyzer);
    b.controller.connect_b1500(16).await.unwrap();
    b.controller.connect_cascade(22).await.unwrap();

    b.controller
        .run_measurement(request("public", &["debug"], "single"))
        .await
        .unwrap();
    assert!(b.controller.info().running);

    assert!(matches!(
        b.controller.disconnect_b1500().unwrap_err(),
        DaqError::Busy(_)
    ));
    assert!(matches!(
        b.controller.disconnect_cascade().unwrap_err(),
        DaqError::Busy(_)
    ));
    assert!(matches!(
        b.controller
            .move_chuck_relative(&json!(5), &json!(5))
            .await
            .unwrap_err(),
        DaqError::Busy(_)
    ));
    assert!(matches!(
        b.controller
            .run_measurement(request("public", &["debug"], "single"))
            .await
            .unwrap_err(),
        DaqError::AlreadyRunning
    ));

    assert!(b.controller.cancel_measurement());
    let outcome = b.controller.wait_for_run().await.unwrap().unwrap();
    assert_eq!(outcome.status, FinishStatus::Cancelled);

    b.controller.disconnect_b1500().unwrap();
    assert!(!b.controller.analyzer_connected());
    assert!(!b.station.contacts_are_down());
}

#[tokio::test]
async fn test_move_chuck_inverts_wafer_frame() {
    let dir = tempfile::tempdir().unwrap();
    let b = bench(dir.path(), SimulatedAnalyzer::new());
    let mut controller = b.controller;
    controller.connect_cascade(22).await.unwrap();

    controller
        .move_chuck_relative(&json!("100"), &json!(-25.5))
        .await
        .unwrap();

    assert_eq!(
        b.station.commands().last(),
        Some(&StationCommand::MoveChuck(StageDelta {
            dx: -100.0,
            dy: 25.5,
            dz: 0.0
        }))
    );
}

#[tokio::test]
async fn test_config_requests_publish_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = bench(dir.path(), SimulatedAnalyzer::new());
    let mut events = b.controller.emitter().subscribe();

    let reply = b
        .controller
        .handle(ControllerRequest::GetMeasurementProgramConfig {
            user: "public".to_string(),
            program: "keysight_id_vgs".to_string(),
            index: 2,
        })
        .await
        .unwrap();
    let ControllerReply::Config { config } = reply else {
        panic!("expected config reply");
    };
    let event = events.recv().await.unwrap();
    assert_eq!(event.msg, "measurement_program_config");
    assert_eq!(event.data["name"], json!("keysight_id_vgs"));
    assert_eq!(event.data["index"], json!(2));
    assert_eq!(event.data["config"], config);

    b.controller
        .handle(ControllerRequest::SetMeasurementSweepConfig {
            user: "public".to_string(),
            sweep: "array".to_string(),
            config: json!({"num_rows": 2, "num_cols": 3, "sweep_order": "col", "dies": []}),
        })
        .await
        .unwrap();
    b.controller
        .handle(ControllerRequest::GetMeasurementSweepConfig {
            user: "public".to_string(),
            sweep: "array".to_string(),
        })
        .await
        .unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.msg, "measurement_sweep_config");
    assert_eq!(event.data["config"]["num_cols"], json!(3));

    let err = b
        .controller
        .handle(ControllerRequest::SetMeasurementProgramConfig {
            user: "public".to_string(),
            program: "keysight_id_vgs".to_string(),
            config: json!([1, 2]),
        })
        .await
        .unwrap_err();
    assert!(err.is_input_error());
}

#[tokio::test]
async fn test_actor_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let b = bench(dir.path(), SimulatedAnalyzer::new());
    let emitter = b.controller.emitter().clone();
    let (handle, task) = b.controller.spawn(8);

    let reply = handle
        .request(ControllerRequest::from_json(json!({"msg": "connect_b1500", "data": {"gpib_address": 16}})).unwrap())
        .await
        .unwrap();
    assert!(matches!(reply, ControllerReply::Idn { .. }));

    let reply = handle
        .request(
            ControllerRequest::from_json(json!({
                "msg": "set_user_setting",
                "data": {"user": "public", "setting": "die_size_x", "value": 24425.0}
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    let ControllerReply::UserSettings { settings } = reply else {
        panic!("expected user settings");
    };
    assert_eq!(settings.die_size_x, 24425.0);

    let mut events = emitter.subscribe();
    let reply = handle
        .request(
            ControllerRequest::from_json(json!({
                "msg": "run_measurement",
                "data": {"user": "public", "programs": ["debug"], "sweep": "single"}
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    assert!(matches!(reply, ControllerReply::RunStarted { .. }));

    loop {
        let event = events.recv().await.unwrap();
        if event.msg == "measurement_finish" {
            assert_eq!(event.data, json!({"status": "success"}));
            break;
        }
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(handle
        .request(ControllerRequest::GetControllerInfo {})
        .await
        .is_err());

    // Dirty settings were flushed on shutdown.
    let saved = std::fs::read_to_string(dir.path().join("public").join("settings.json")).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved["die_size_x"], json!(24425.0));
}
