//! `wafer_daq` command line.
//!
//! ```text
//! wafer_daq run request.json          execute a run against simulated instruments
//! wafer_daq check-config              load and validate the configuration
//! wafer_daq heightmap model.toml ...  sample a height model into a calibration file
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::info;
use wafer_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use wafer_daq::events::FinishStatus;
use wafer_daq::instrument::mock::{MockProbeStation, SimulatedAnalyzer, SimulatedConnector};
use wafer_daq::messages::RunMeasurementRequest;
use wafer_daq::wafer::{HeightModel, WaferCalibration};
use wafer_daq::{logging, Controller};

#[derive(Parser, Debug)]
#[command(name = "wafer_daq", version, about = "Wafer-probe measurement orchestration")]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a run request against simulated instruments and print its events
    Run(RunArgs),
    /// Load and validate the configuration, then print it
    CheckConfig,
    /// Sample a height model at die centres and write a calibration file
    Heightmap(HeightmapArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON file holding the `run_measurement` parameters
    request: PathBuf,

    /// Simulated duration of each analyzer step, in milliseconds
    #[arg(long, default_value_t = 0)]
    step_delay_ms: u64,

    /// Print progress records as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct HeightmapArgs {
    /// Height model coefficients (`.toml` or `.json`)
    model: PathBuf,

    /// Output calibration file (`.toml` or `.json`)
    #[arg(long, short)]
    output: PathBuf,

    /// Radius of the sampled die disc, in dies
    #[arg(long, default_value_t = 10)]
    radius: i32,

    /// Die pitch along x, µm
    #[arg(long, default_value_t = 10000.0)]
    die_size_x: f64,

    /// Die pitch along y, µm
    #[arg(long, default_value_t = 10000.0)]
    die_size_y: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    logging::init_from_config(&settings)?;

    match cli.command {
        Command::Run(args) => run(settings, args).await,
        Command::CheckConfig => check_config(&settings),
        Command::Heightmap(args) => heightmap(&args),
    }
}

fn check_config(settings: &Settings) -> Result<()> {
    if let Some(path) = &settings.calibration_file {
        let calibration = WaferCalibration::load(path)?;
        println!(
            "calibration: {} height offsets from {}",
            calibration.height_offset_table.len(),
            path.display()
        );
    }
    print!("{}", toml::to_string_pretty(settings)?);
    Ok(())
}

fn read_model(path: &Path) -> Result<HeightModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read height model {}", path.display()))?;
    let model = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        Some("toml") => toml::from_str(&text)?,
        other => bail!("Unsupported height model extension {other:?}"),
    };
    Ok(model)
}

fn heightmap(args: &HeightmapArgs) -> Result<()> {
    let model = read_model(&args.model)?;
    let base = WaferCalibration::with_die_size(args.die_size_x, args.die_size_y);
    base.validate()?;
    let dies = HeightModel::dies_within(args.radius);
    let table = model.sample_table(&dies, &base)?;
    let calibration = base.with_height_offsets(table);

    let text = match args.output.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(&calibration)?,
        Some("toml") => toml::to_string_pretty(&calibration)?,
        other => bail!("Unsupported output extension {other:?}"),
    };
    std::fs::write(&args.output, text)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!(
        dies = dies.len(),
        output = %args.output.display(),
        "height offset table written"
    );
    Ok(())
}

async fn run(settings: Settings, args: RunArgs) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.request)
        .await
        .with_context(|| format!("Failed to read run request {}", args.request.display()))?;
    let request: RunMeasurementRequest =
        serde_json::from_str(&text).context("Malformed run request")?;

    let analyzer =
        SimulatedAnalyzer::new().with_step_delay(Duration::from_millis(args.step_delay_ms));
    let connector = Arc::new(SimulatedConnector::new(analyzer, MockProbeStation::new()));
    let gpib_b1500 = settings.instruments.gpib_b1500;
    let gpib_cascade = settings.instruments.gpib_cascade;

    let mut controller = Controller::new(settings, connector)?;
    let mut events = pin!(controller.emitter().events().stream_since(0));
    let mut data = pin!(controller.emitter().data().stream_since(0));

    controller.connect_b1500(gpib_b1500).await?;
    controller.connect_cascade(gpib_cascade).await?;
    let run_id = controller.run_measurement(request).await?;
    info!(%run_id, "run started, press Ctrl-C to cancel");

    let status = loop {
        tokio::select! {
            event = events.next() => match event {
                Some(record) => {
                    println!("{} {}", record.msg, record.data);
                    if record.msg == "measurement_finish" {
                        break record.data.get("status").cloned();
                    }
                }
                None => bail!("event stream closed before the run finished"),
            },
            Some(record) = data.next() => {
                if args.json {
                    println!("{}", record.data);
                } else {
                    let meta = &record.data["metadata"];
                    println!(
                        "{} step {}/{} {}",
                        meta["program"].as_str().unwrap_or_default(),
                        meta["step"].as_u64().unwrap_or_default() + 1,
                        meta["step_total"],
                        record.data["data"]["step_names"]
                            .as_array()
                            .and_then(|names| names.last())
                            .and_then(|name| name.as_str())
                            .unwrap_or_default(),
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if controller.cancel_measurement() {
                    info!("cancel requested, stopping after the current step");
                }
            }
        }
    };

    if let Some(outcome) = controller.wait_for_run().await {
        let outcome = outcome?;
        println!(
            "run {} finished: {:?}, {} datasets",
            outcome.run_id,
            outcome.status,
            outcome.results.len()
        );
    }
    controller.shutdown().await;

    match status.and_then(|s| serde_json::from_value::<FinishStatus>(s).ok()) {
        Some(FinishStatus::Error) => bail!("measurement run failed"),
        _ => Ok(()),
    }
}
