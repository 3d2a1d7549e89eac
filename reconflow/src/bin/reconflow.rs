//! Command-line driver for one subject's reconstruction.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reconflow::config::PipelineConfig;
use reconflow::events::LoggingEventSink;
use reconflow::observability::{init_logging, LogFormat};
use reconflow::pipeline::ReconPipeline;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Surface reconstruction orchestrator.
#[derive(Parser, Debug)]
#[command(name = "reconflow")]
#[command(about = "Runs surface reconstruction and brain-mask refinement for one subject", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON pipeline configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log format, overriding the configuration file.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the waves the pipeline would run.
    Plan,
    /// Run the pipeline and print the report as JSON.
    Run {
        /// Use the learned engine regardless of the configuration.
        #[arg(long)]
        learned: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Plain,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Plain => Self::Plain,
            LogFormatArg::Json => Self::Json,
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let path = cli
        .config
        .as_ref()
        .context("a configuration file is required (--config <path>)")?;
    PipelineConfig::from_json_file(path).with_context(|| format!("Failed to load config: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    let format = cli.log_format.map_or(config.log_format, LogFormat::from);
    init_logging(format, "reconflow=info");

    match cli.command {
        Command::Plan => {
            let plan = ReconPipeline::new(config).plan().context("Invalid pipeline")?;
            for (index, wave) in plan.waves().iter().enumerate() {
                println!("{index:>2} {:<10} {}", wave.label(), wave.stage_names().join(" "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { learned } => {
            config.use_learned |= learned;
            let pipeline = ReconPipeline::new(config).with_events(Arc::new(LoggingEventSink::default()));
            let report = pipeline.run().await.context("Invalid pipeline")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}
