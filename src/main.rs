use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use log::info;
use model_inspector::{
    inspect, stage_request, ArtifactPorts, FsPorts, IndicatifProgressReporter, InspectRequest,
    InspectResponse, InspectStep, InspectorConfig, NoProgressReporter, ProgressReporter,
    DEFAULT_ARTIFACTS_DIR, DEFAULT_REPORTS_DIR,
};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Model artifact (.joblib or .pkl).
    #[arg(value_name = "MODEL_PATH")]
    model_path: PathBuf,

    /// Optional scaler artifact inspected alongside the model.
    #[arg(long, value_name = "PATH")]
    scaler: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        env = "MODEL_INSPECTOR_REPORTS_DIR",
        default_value = DEFAULT_REPORTS_DIR
    )]
    reports_dir: PathBuf,

    #[arg(
        long,
        value_name = "DIR",
        env = "MODEL_INSPECTOR_ARTIFACTS_DIR",
        default_value = DEFAULT_ARTIFACTS_DIR
    )]
    artifacts_dir: PathBuf,

    /// Copy the inputs into the artifacts directory before inspecting.
    #[arg(long)]
    stage: bool,

    /// Print the response as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the spinner and the console summary.
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init_from_env(Env::default().default_filter_or("warn"));

    let cli = Cli::parse();
    let config = InspectorConfig::new(&cli.reports_dir, &cli.artifacts_dir);
    let mut request = InspectRequest::new(&cli.model_path, cli.scaler.clone());

    let ports = FsPorts::new();
    let progress: Box<dyn ProgressReporter> = if cli.quiet {
        Box::new(NoProgressReporter::new())
    } else {
        Box::new(IndicatifProgressReporter::new())
    };

    if cli.stage {
        progress.on_step(InspectStep::Staging);
        request = stage_request(&request, &config.artifacts_dir)
            .map_err(|err| format!("[{}] {err}", err.status_code()))?;
        info!("staged model at {}", request.model_path.display());
    }

    let response = run(&ports, progress.as_ref(), &config, &request, cli.quiet)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!(
            "class: {} module: {} task: {} report: {}",
            response.model_summary.class_name,
            response.model_summary.module,
            response.model_summary.task,
            response.report_path.display()
        );
    }

    Ok(())
}

fn run(
    ports: &dyn ArtifactPorts,
    progress: &dyn ProgressReporter,
    config: &InspectorConfig,
    request: &InspectRequest,
    quiet: bool,
) -> Result<InspectResponse, Box<dyn Error>> {
    let mut console: Box<dyn Write> = if quiet {
        Box::new(io::sink())
    } else {
        Box::new(io::stderr())
    };

    inspect(ports, progress, config, request, console.as_mut())
        .map_err(|err| format!("[{}] {err}", err.status_code()).into())
}
