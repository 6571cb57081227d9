//! trigcap binary: edge-triggered camera capture for experiment runs.
//!
//! Polls a trigger and a gate input at a fixed cadence; every qualifying
//! rising edge consumes a trigger index, and, when the gate is high, queues
//! one still-image capture. Captures run strictly one at a time through an
//! external tool; the run's numbering survives restarts via the experiment
//! store.
//!
//! Exit codes mirror the preflight checks: 2 = directory/disk problem,
//! 3 = capture tool missing, 4 = camera probe timed out, 5 = camera probe
//! failed, 1 = runtime failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trigcap::capture::{CaptureQueue, GphotoExecutor};
use trigcap::config::Settings;
use trigcap::error::CaptureError;
use trigcap::hardware::sysfs::SysfsInput;
use trigcap::orchestrator::Orchestrator;
use trigcap::startup;
use trigcap::store::{ExperimentStore, RunMode};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "trigcap", version, about = "Edge-triggered camera capture controller")]
struct Cli {
    /// Base experiment folder (the run folder is created inside).
    #[arg(long)]
    base: PathBuf,

    /// Resume the latest run or start a new one.
    #[arg(long, value_enum, default_value = "resume")]
    mode: RunMode,

    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the disk-space and camera preflight checks.
    #[arg(long)]
    skip_preflight: bool,
}

fn exit_code_for(e: &CaptureError) -> ExitCode {
    match e {
        CaptureError::Startup(_) => ExitCode::from(2),
        CaptureError::ToolMissing(_) => ExitCode::from(3),
        CaptureError::CommandTimeout(_) => ExitCode::from(4),
        CaptureError::CommandFailed(_) => ExitCode::from(5),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            exit_code_for(&e)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CaptureError> {
    let settings = Settings::load(cli.config.as_deref())?;

    if cli.skip_preflight {
        info!("preflight skipped");
    } else {
        startup::preflight(&settings, &cli.base).await?;
    }

    let store = ExperimentStore::open(&cli.base, cli.mode, &settings.capture.extension)?;
    {
        let ctx = store.context();
        info!(run_dir = %ctx.run_dir.display(), "run folder");
        info!(photos = %ctx.photos_dir.display(), "photos");
        info!(log = %ctx.log_path.display(), "log");
        info!(state = %ctx.state_path.display(), "state");
    }

    let trigger_input = SysfsInput::open(settings.gpio.trigger_pin)?;
    let gate_input = SysfsInput::open(settings.gpio.enable_pin)?;

    let executor = Arc::new(GphotoExecutor::new(&settings.capture));
    let queue = CaptureQueue::spawn(executor);
    let mut orchestrator = Orchestrator::new(trigger_input, gate_input, store, queue)?;

    info!(
        trigger_pin = settings.gpio.trigger_pin,
        enable_pin = settings.gpio.enable_pin,
        poll = ?settings.gpio.poll_interval,
        "READY"
    );

    let mut interval = tokio::time::interval(settings.gpio.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => orchestrator.tick()?,
            _ = &mut ctrl_c => {
                info!("interrupt received, stopping");
                break;
            }
        }
    }

    // Give an in-flight capture one attempt's worth of time to finish.
    orchestrator.shutdown(settings.capture.timeout).await
}
