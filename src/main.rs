use std::panic;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Config};
use crate::core::scheduler::Scheduler;
use crate::core::tester::Tester;
use crate::core::traits::{batch::BatchSystem, runner::Runner};
use crate::harness::ConsoleHarness;
use crate::native::{
    batch_runner::BatchRunner, load::SystemLoad, local_runner::LocalRunner, pbs::PbsSystem,
};
use crate::stubs::runner::RunnerStub;

mod config;
mod constants;
mod core;
mod harness;
mod native;
mod stubs;


#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let config = Config::load(&cli)?;
    if !run(config).await? {
        std::process::exit(1);
    }
    Ok(())
}

/// Runs every test of the manifest; `Ok(false)` when any test failed.
#[tracing::instrument(skip_all, fields(tests = config.tests.len()))]
async fn run(config: Config) -> Result<bool, Box<dyn std::error::Error>> {
    let mut harness =
        ConsoleHarness::new(config.options.clone(), std::io::stdout()).with_dry_run(config.dry_run);

    let mut jobs = Vec::with_capacity(config.tests.len());
    for spec in config.tests {
        let mut tester = Tester::new(spec)?;
        let job = tester.job(&config.options);
        let skipped = match tester.skip_reason() {
            Some(reason) => {
                harness.report_skipped(&job.name, reason);
                true
            }
            None => false,
        };
        harness.add_tester(tester);
        jobs.push((job, skipped));
    }

    let batch: Option<Arc<dyn BatchSystem>> = match &config.batch {
        Some(batch) => Some(Arc::new(PbsSystem::new(batch.pbs.clone())?) as Arc<dyn BatchSystem>),
        None => None,
    };

    let max_memory = config.max_memory;
    let mut scheduler = Scheduler::new(config.scheduler, harness, Arc::new(SystemLoad))?;
    tracing::info!("Starting {} jobs", jobs.len());

    for (job, skipped) in jobs {
        if skipped {
            scheduler.job_skipped(&job.name);
            continue;
        }
        let runner: Box<dyn Runner> = match (&batch, &config.batch) {
            _ if config.dry_run => Box::new(RunnerStub::dry_run()),
            (Some(batch), Some(batch_config)) => Box::new(
                BatchRunner::new(batch.clone())
                    .with_wait_output_time(batch_config.wait_output_time),
            ),
            _ => Box::new(LocalRunner::new(max_memory)),
        };
        scheduler.run(job, runner).await?;
    }
    scheduler.join().await?;
    for line in scheduler.log().timeline() {
        tracing::info!("{line}");
    }
    if !scheduler.stranded().is_empty() {
        tracing::warn!("{} jobs never ran", scheduler.stranded().len());
    }

    let summary = scheduler.into_harness().finish();
    Ok(summary.success())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
