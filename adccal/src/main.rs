//! adccal CLI: runs one pipeline stage from a YAML profile.

use std::path::PathBuf;
use std::process::ExitCode;

use adccal::{Orchestrator, Overrides, PipelineConfig, RunReport, StageConfig};
use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "adccal")]
#[command(about = "Per-pixel ADC calibration: gather, process and correction stages")]
#[command(version)]
struct Cli {
    /// YAML configuration profile
    #[arg(long = "config-file", short = 'c', default_value = "conf/default.yaml")]
    config_file: PathBuf,

    /// Stage to run: gather, process or correction
    #[arg(short = 't', long = "type")]
    run_type: Option<String>,

    /// Input directory (gather/process) or raw data file (correction)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory (gather/process) or output file (correction)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run identifier
    #[arg(short, long)]
    run: Option<String>,

    /// Method name of the selected stage
    #[arg(short, long)]
    method: Option<String>,

    /// Columns per block
    #[arg(long)]
    n_cols: Option<usize>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rotated log files. Console only when absent.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            input: self.input.clone(),
            output: self.output.clone(),
            run_id: self.run.clone(),
            method: self.method.clone(),
            run_type: self.run_type.clone(),
            n_cols: self.n_cols,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Nothing is listening to tracing yet, so this one goes straight to stderr.
    if let Err(err) = init_logging(&cli) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    match &cli.log_dir {
        Some(dir) => common::log_setup::setup_logging(&cli.log_level, dir, "adccal"),
        None => {
            common::log_setup::setup_console_logging(&cli.log_level);
            Ok(())
        }
    }
}

/// Returns whether every unit of work succeeded.
fn run(cli: &Cli) -> Result<bool> {

    let config = PipelineConfig::load(&cli.config_file, &cli.overrides())
        .with_context(|| format!("Invalid configuration {}", cli.config_file.display()))?;
    tracing::info!(
        run_type = %config.run_type,
        config = %cli.config_file.display(),
        "Configuration loaded"
    );

    let orchestrator = || -> Result<Orchestrator> {
        let settings = config
            .orchestrator
            .clone()
            .context("Column-block settings missing for a partitioned stage")?;
        Ok(Orchestrator::new(settings)?)
    };

    match &config.stage {
        StageConfig::Gather(gather) => {
            let report = orchestrator()?
                .run_gather(gather)
                .context("Gather stage failed")?;
            Ok(summarize(&report))
        }
        StageConfig::Process(process) => {
            let report = orchestrator()?
                .run_process(process)
                .context("Process stage failed")?;
            Ok(summarize(&report))
        }
        StageConfig::Correction(correction) => {
            correction
                .method
                .create(correction)
                .run()
                .with_context(|| {
                    format!("Correction of {} failed", correction.data_file.display())
                })?;
            Ok(true)
        }
    }
}

fn summarize(report: &RunReport) -> bool {
    for outcome in report.failed() {
        tracing::error!(block = %outcome.block, status = ?outcome.status, "Failed block");
    }
    tracing::info!(
        written = report.n_written(),
        skipped = report.n_skipped(),
        failed = report.failed().count(),
        "Run finished"
    );
    report.is_success()
}
