use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cmip_harvest::app::{App, ProgressSink};
use cmip_harvest::config::{ConfigLoader, ResolvedConfig};
use cmip_harvest::download::{DapTransfer, HttpTransfer};
use cmip_harvest::error::HarvestError;
use cmip_harvest::output::{JsonOutput, OutputMode, StderrProgress};
use cmip_harvest::search::EsgfHttpNode;

#[derive(Parser)]
#[command(name = "cmip-harvest")]
#[command(about = "Harvest, select and download CMIP6 model output from ESGF index nodes")]
#[command(version, author)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Path to a JSON config file (default: ./cmip-harvest.json if present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Workspace root, overriding the config file
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// Print the stage report as JSON on stdout instead of progress lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Search index nodes and write one raw listing per experiment/variable")]
    Harvest,
    #[command(about = "Normalize raw listings into per-source catalogs")]
    Process,
    #[command(about = "Select complete sources into download queues")]
    Queue,
    #[command(about = "Download queued files, skipping files already present")]
    Download,
    #[command(about = "Re-search and retry files that failed to download")]
    Recover,
    #[command(about = "Run every stage in order")]
    Run,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidConfig(_) => 2,
        HarvestError::Filesystem(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.global.json {
        OutputMode::Json
    } else {
        OutputMode::Progress
    };

    let mut config = ConfigLoader::resolve(cli.global.config.as_deref())?;
    if let Some(workspace) = cli.global.workspace {
        config.workspace = workspace.into();
    }
    let app = build_app(config)?;

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Progress => &StderrProgress,
    };

    match cli.command {
        Command::Harvest => emit(output_mode, &app.harvest(sink)?),
        Command::Process => emit(output_mode, &app.process(sink)?),
        Command::Queue => emit(output_mode, &app.queue(sink)?),
        Command::Download => {
            let report = app.download(sink)?;
            if matches!(output_mode, OutputMode::Progress) && !report.failed.is_empty() {
                eprintln!(
                    "{} files failed; run `cmip-harvest recover` to retry them",
                    report.failed.len()
                );
            }
            emit(output_mode, &report)
        }
        Command::Recover => {
            let report = app.recover(sink)?;
            if matches!(output_mode, OutputMode::Progress) {
                for filename in &report.still_failed {
                    eprintln!("still failed: {filename}");
                }
            }
            emit(output_mode, &report)
        }
        Command::Run => emit(output_mode, &app.run(sink)?),
    }
}

fn build_app(
    config: ResolvedConfig,
) -> Result<App<EsgfHttpNode, HttpTransfer, DapTransfer>, HarvestError> {
    let network = &config.network;
    let nodes = config
        .index_nodes
        .iter()
        .map(|endpoint| EsgfHttpNode::new(endpoint, network.timeout, network.page_size))
        .collect::<Result<Vec<_>, _>>()?;
    let transfer = HttpTransfer::new(network.timeout, network.transfer_timeout)?;
    let query = DapTransfer::new(network.timeout, network.transfer_timeout)?;
    Ok(App::new(config, nodes, transfer, query))
}

fn emit<T: Serialize>(output_mode: OutputMode, report: &T) -> miette::Result<()> {
    if matches!(output_mode, OutputMode::Json) {
        JsonOutput::print(report).into_diagnostic()?;
    }
    Ok(())
}
