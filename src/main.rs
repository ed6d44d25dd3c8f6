//! # Scaling Benchmark - Main Entry Point
//!
//! Runs the strong/weak scaling comparison of every selected server variant
//! and writes the session artifacts.
//!
//! ## Execution Flow
//!
//! 1. **Parse arguments and initialize logging**
//! 2. **Short-circuit modes**: `--list-variants` prints the catalog,
//!    `--report-only` regenerates reports from an existing raw dump
//! 3. **Resolve configuration**: unknown variants and bad numbers are
//!    rejected before any process is started
//! 4. **Install signal handling**: SIGINT/SIGTERM flip the shutdown token
//! 5. **Run all variants**: each one is built, started, swept and stopped
//! 6. **Finalize**: raw dump, aggregation, CSV and text reports
//!
//! An interrupted session still stops the live server and writes every
//! artifact for what was measured, then exits with an error.

use anyhow::{Context, Result};
use clap::Parser;
use scaling_bench::{
    aggregate::analyze,
    cli::Args,
    config::{builtin_variants, load_variants, BenchConfig},
    defaults,
    error::BenchError,
    executor::{ClientInvoker, ProcessClient, RunExecutor},
    logging,
    poll::{spawn_signal_watcher, Clock, Shutdown, SystemClock},
    privilege::CredentialKeepalive,
    report::ReportWriter,
    results::{RawResults, ResultsManager, SessionSettings},
    scaling::ScalingDriver,
    supervisor::ProcessSupervisor,
    VERSION,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    if args.list_variants {
        return list_variants(&args);
    }
    if let Some(raw_path) = &args.report_only {
        return report_only(raw_path, &args);
    }

    info!("Starting Scaling Benchmark v{}", VERSION);
    let config = BenchConfig::from_args(&args)?;
    debug!("Configuration: {:?}", config);
    info!(
        "Variants: {}",
        config
            .variants
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (trigger, shutdown) = Shutdown::new();
    let signals = match spawn_signal_watcher(trigger) {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("Could not install signal handlers ({}); interrupts will not be graceful", e);
            None
        }
    };

    let keepalive = if config.needs_elevation() {
        Some(CredentialKeepalive::spawn(defaults::KEEPALIVE_INTERVAL))
    } else {
        None
    };

    let mut results = ResultsManager::new(&config.output_dir)?;
    info!("Session directory: {}", config.output_dir.display());

    let driver = build_driver(&config, shutdown);
    let outcome = driver.run_all(&config.variants, &mut results).await;

    if let Some(keepalive) = keepalive {
        keepalive.stop().await;
    }
    if let Some(signals) = signals {
        signals.abort();
    }

    let raw = results.finalize(SessionSettings::from(&config))?;
    let analysis = analyze(&raw.records, &raw.outcomes, &config.baseline);
    ReportWriter::new(results.output_dir()).write_all(&raw, &analysis)?;

    let failed = raw.outcomes.iter().filter(|o| o.is_failed()).count();
    match outcome {
        Ok(()) => {
            if failed > 0 {
                warn!("{} of {} variants failed; see report.txt", failed, raw.outcomes.len());
            }
            info!("Scaling Benchmark completed: {}", results.output_dir().display());
            Ok(())
        }
        Err(BenchError::Cancelled) => {
            error!(
                "Interrupted; partial results written to {}",
                results.output_dir().display()
            );
            Err(BenchError::Cancelled.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Wire the real process-backed components together.
fn build_driver(config: &BenchConfig, shutdown: Shutdown) -> ScalingDriver {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client: Arc<dyn ClientInvoker> = Arc::new(ProcessClient::new(
        config.client.clone(),
        config.project_dir.clone(),
    ));

    let mut supervisor = ProcessSupervisor::new(
        config.host.clone(),
        config.project_dir.clone(),
        config.output_dir.clone(),
        config.timings,
        clock.clone(),
        shutdown.clone(),
    );
    if config.health_check {
        supervisor = supervisor.with_health_check(client.clone());
    }

    let executor = RunExecutor::new(
        client,
        config.host.clone(),
        config.client.timeout,
        config.timings.run_pause,
        clock.clone(),
        shutdown.clone(),
    );

    ScalingDriver::new(
        Arc::new(supervisor),
        executor,
        config.plan.clone(),
        config.timings,
        clock,
        shutdown,
    )
}

fn list_variants(args: &Args) -> Result<()> {
    let catalog = match &args.variants_file {
        Some(path) => load_variants(path)?,
        None => builtin_variants(),
    };
    println!("{:<18} {:>6} {:>9}  description", "name", "port", "elevated");
    for variant in catalog {
        println!(
            "{:<18} {:>6} {:>9}  {}",
            variant.name,
            variant.listen_port,
            if variant.needs_privilege_elevation { "yes" } else { "no" },
            variant.description
        );
    }
    Ok(())
}

/// Rebuild CSV and text reports next to an existing raw dump.
fn report_only(raw_path: &Path, args: &Args) -> Result<()> {
    let raw = RawResults::load(raw_path)?;
    // An explicit --baseline overrides the one recorded in the dump.
    let baseline = args
        .baseline
        .clone()
        .unwrap_or_else(|| raw.metadata.settings.baseline.clone());
    let dir = raw_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    info!(
        "Regenerating reports from {} ({} records, baseline {})",
        raw_path.display(),
        raw.records.len(),
        baseline
    );
    let analysis = analyze(&raw.records, &raw.outcomes, &baseline);
    ReportWriter::new(dir)
        .write_all(&raw, &analysis)
        .with_context(|| format!("cannot write reports into {}", dir.display()))?;
    Ok(())
}
