//! CLI entry point for rust_fplc.
//!
//! - `serve`: start the instrument server, optionally running a method once the
//!   instrument connects.
//! - `check`: validate a method document and print its steps.
//! - `calibrate`: convert one raw detector line to physical units.
//!
//! ```bash
//! rust_fplc serve --config config/fplc.toml --method methods/desalt.json
//! rust_fplc check methods/desalt.json
//! rust_fplc calibrate "1200,40,3.5,0.25,0,0" --monitor uv-mii --aufs 0.1
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_fplc::acquisition::calibrate;
use rust_fplc::config::{FplcConfig, DEFAULT_CONFIG_PATH};
use rust_fplc::experiment::EngineNotice;
use rust_fplc::instrument::{MonitorSettings, MonitorType};
use rust_fplc::logging;
use rust_fplc::method::{MethodDocument, MethodStep};
use rust_fplc::network::{ConnectionState, RawSample};
use rust_fplc::ControllerRuntime;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rust_fplc")]
#[command(about = "FPLC instrument controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept the instrument connection and execute methods
    Serve {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Method document to run once the instrument connects
        #[arg(long)]
        method: Option<PathBuf>,
    },

    /// Validate a method document
    Check {
        /// Method document (.json)
        method: PathBuf,
    },

    /// Calibrate a raw detector line
    Calibrate {
        /// `chan1,chan2,elapsed,eluate,frac_mark,pump_b`
        line: String,

        /// Absorbance monitor model
        #[arg(long, value_enum, default_value_t = MonitorArg::UvMii)]
        monitor: MonitorArg,

        /// Monitor sensitivity (AUFS)
        #[arg(long, default_value_t = 0.1)]
        aufs: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MonitorArg {
    /// Pharmacia UV-MII
    UvMii,
    /// BioRad EM-1
    Em1,
}

impl From<MonitorArg> for MonitorType {
    fn from(value: MonitorArg) -> Self {
        match value {
            MonitorArg::UvMii => MonitorType::PharmaciaUvMii,
            MonitorArg::Em1 => MonitorType::BioRadEm1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, method } => serve(config, method).await,
        Commands::Check { method } => check(method),
        Commands::Calibrate {
            line,
            monitor,
            aufs,
        } => calibrate_line(&line, monitor.into(), aufs),
    }
}

async fn serve(config_path: PathBuf, method: Option<PathBuf>) -> Result<()> {
    let config = FplcConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let runtime = ControllerRuntime::start(&config).await?;
    info!(
        name = %config.application.name,
        addr = %runtime.local_addr(),
        "Waiting for instrument"
    );

    let controller = runtime.handle();
    let mut notices = controller.subscribe_notices().await?;

    if let Some(path) = method {
        let steps = controller.load_method(&path).await?;
        info!(path = %path.display(), steps, "Method queued");

        let mut connection = runtime.subscribe_connection();
        connection
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .context("connection manager stopped")?;
        controller.run_method().await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => report(&notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notice stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn report(notice: &EngineNotice) {
    match notice {
        EngineNotice::RunSaved(path) => info!(path = %path.display(), "Run log saved"),
        EngineNotice::StorageFailed(reason) => error!(%reason, "Run log failed"),
        EngineNotice::DeviceFault(subsystem) => warn!(%subsystem, "Device fault"),
        EngineNotice::CommandFailed { tag, reason } => warn!(%tag, %reason, "Command failed"),
        EngineNotice::RunRejected { reason } => warn!(%reason, "Run rejected"),
        other => info!(notice = ?other, "Controller notice"),
    }
}

fn check(path: PathBuf) -> Result<()> {
    let (instrument, method) = MethodDocument::load(&path)?.into_sequence()?;
    let minutes: f64 = method.iter().map(MethodStep::duration_minutes).sum();
    println!(
        "{}: {} steps, {:.2} ml total, about {:.1} min ({}, {} at {} AUFS)",
        path.display(),
        method.len(),
        method.total_volume(),
        minutes,
        instrument.column_type,
        instrument.monitor_type,
        instrument.aufs
    );
    for (index, step) in method.iter().enumerate() {
        println!("{:>3}. {}", index + 1, step);
    }
    Ok(())
}

fn calibrate_line(line: &str, monitor: MonitorType, aufs: f64) -> Result<()> {
    let raw = RawSample::parse(line).ok_or_else(|| anyhow!("not a raw sample line: {line}"))?;
    let settings = MonitorSettings::new(monitor, aufs)?;
    let sample = calibrate(&raw, &settings);
    println!("{}", serde_json::to_string_pretty(&sample)?);
    Ok(())
}
