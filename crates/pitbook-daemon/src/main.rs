//! pitbook-daemon - Loyalty Accrual Recovery Host
//!
//! Foreground process that periodically sweeps for closed rating sessions
//! whose point accrual never committed and re-drives them on the service
//! lane. Configuration comes from a TOML file; the sweep interval, batch
//! limit, and acting service account live in its `[recovery]` section.
//!
//! The command dispatch surface is a library (`pitbook_daemon::dispatch`)
//! linked by the surrounding workflow layer; this binary hosts only the
//! part that must run unattended.
//!
//! Shuts down cleanly on SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pitbook_core::config::PitbookConfig;
use pitbook_core::store::Store;
use pitbook_daemon::metrics::{new_shared_registry, SharedMetricsRegistry};
use pitbook_daemon::recovery::{RecoveryCoordinator, SweepReport};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// pitbook daemon - loyalty accrual recovery host
#[derive(Parser, Debug)]
#[command(name = "pitbook-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pitbook.toml")]
    config: PathBuf,

    /// Log filter directive (RUST_LOG syntax)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run one recovery sweep and exit
    #[arg(long)]
    sweep_once: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(args).await
}

/// Everything after CLI parsing and log setup. A disabled sweep exits
/// before the store is opened; `--sweep-once` forces a single pass even
/// while the periodic loop is disabled.
async fn run(args: Args) -> Result<()> {
    let config = PitbookConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        db_path = %config.db_path.display(),
        "pitbook daemon starting"
    );

    if !args.sweep_once && !config.recovery.enabled {
        info!("recovery sweep disabled in config, nothing to host");
        return Ok(());
    }

    let store = Arc::new(
        Store::open(&config.db_path, config.store_options())
            .with_context(|| format!("failed to open store at {}", config.db_path.display()))?,
    );
    let metrics = new_shared_registry().context("failed to register metrics")?;
    let coordinator = Arc::new(build_coordinator(&config, store, metrics)?);

    if args.sweep_once {
        let report = run_sweep(&coordinator).await?;
        info!(
            scanned = report.scanned,
            recovered = report.recovered,
            failed = report.failed,
            "single sweep complete"
        );
        return Ok(());
    }

    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    info!(
        interval_secs = config.recovery.sweep_interval_secs,
        batch_limit = config.recovery.batch_limit,
        "recovery sweep loop running"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_sweep(&coordinator).await {
                    Ok(report) if report.scanned == 0 => {
                        debug!("sweep found no unaccrued sessions");
                    }
                    Ok(report) => {
                        info!(
                            scanned = report.scanned,
                            recovered = report.recovered,
                            failed = report.failed,
                            "recovery sweep pass complete"
                        );
                    }
                    Err(err) => {
                        error!(error = %err, "recovery sweep pass failed");
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    info!("pitbook daemon stopped");
    Ok(())
}

fn build_coordinator(
    config: &PitbookConfig,
    store: Arc<Store>,
    metrics: SharedMetricsRegistry,
) -> Result<RecoveryCoordinator> {
    let Some(account) = config.recovery.service_account.clone() else {
        bail!("[recovery].service_account must name a configured service account");
    };
    let registry = config
        .service_registry()
        .context("invalid service account configuration")?;
    Ok(RecoveryCoordinator::new(
        store,
        registry,
        account,
        config.recovery.batch_limit,
        metrics,
    ))
}

/// Runs one sweep pass off the async runtime; the store is synchronous.
async fn run_sweep(coordinator: &Arc<RecoveryCoordinator>) -> Result<SweepReport> {
    let sweeper = Arc::clone(coordinator);
    let report = tokio::task::spawn_blocking(move || sweeper.sweep())
        .await
        .context("sweep task panicked")??;
    Ok(report)
}
