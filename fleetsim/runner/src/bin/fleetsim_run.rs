//! CLI entry point: load a scenario file, run it, exit non-zero on the
//! first validation, event, or assertion error.

use std::{path::PathBuf, process, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use fleetsim_clock::SystemClock;
use fleetsim_configs::Scenario;
use fleetsim_core::shutdown_channel;
use fleetsim_runner::{RunnerOptions, ScenarioRunner};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleetsim-run", about = "Run a fleetsim scenario")]
struct Args {
    /// Scenario YAML file.
    scenario: PathBuf,

    /// Base directory for run output (default: runs/ or FLEETSIM_REPORT_DIR).
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Override the scenario seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Keep the simulation alive after the run until ctrl-c.
    #[arg(long)]
    wait_for_cancel: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(error) = run(Args::parse()).await {
        warn!("scenario run failed: {error:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = fleetsim_env::fleetsim_log_level()
        .map_or_else(EnvFilter::from_default_env, EnvFilter::new);
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let mut scenario = Scenario::from_yaml_file(&args.scenario)
        .with_context(|| format!("loading scenario {}", args.scenario.display()))?;

    if let Some(seed) = args.seed.or_else(fleetsim_env::fleetsim_seed) {
        if let Some(stress) = scenario.stress.as_mut() {
            stress.seed = Some(seed);
        }
    }

    let mut options = RunnerOptions::default();
    if let Some(report_dir) = args.report_dir {
        options.report_base = report_dir;
    }
    options.wait_for_cancel = args.wait_for_cancel;

    let (handle, signal) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, cancelling scenario");
            handle.shutdown();
        }
    });

    let runner = ScenarioRunner::with_clock(scenario, Arc::new(SystemClock::new()), options);
    let summary = runner.run(&signal).await?;

    info!(
        scenario = %summary.scenario,
        nodes = summary.nodes,
        failures = summary.total_failures,
        recoveries = summary.total_recoveries,
        report = summary
            .report_dir
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_default(),
        "scenario passed"
    );
    Ok(())
}
