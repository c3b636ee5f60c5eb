use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::constants::{
    DEFAULT_MPI_COMMAND, DEFAULT_WAIT_OUTPUT_TIME, MAX_TIME_ENV, MPI_COMMAND_ENV,
};
use crate::core::scheduler::SchedulerConfig;
use crate::core::tester::{RunOptions, TestSpec, ValgrindMode};
use crate::native::pbs::PbsConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Hpc {
    Pbs,
}

/// Runs a manifest of tests in parallel, honoring prerequisites.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// TOML test manifest
    pub manifest: PathBuf,

    /// Maximum number of concurrently running jobs
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Do not start new jobs while the load average is at or above this
    #[arg(short = 'l', long = "load")]
    pub load: Option<f64>,

    /// MPI processes per test
    #[arg(short = 'p', long)]
    pub parallel: Option<u32>,

    /// Threads per process
    #[arg(long = "n-threads")]
    pub n_threads: Option<u32>,

    #[arg(long, value_enum)]
    pub valgrind: Option<ValgrindMode>,

    /// Pass each test's refinement level with -r
    #[arg(long)]
    pub scaling: bool,

    /// Submit jobs to an HPC queue instead of running them here
    #[arg(long, value_enum)]
    pub hpc: Option<Hpc>,

    /// Seconds to wait for a batch job's output files
    #[arg(long = "hpc-file-timeout")]
    pub hpc_file_timeout: Option<u64>,

    #[arg(long = "pbs-queue")]
    pub pbs_queue: Option<String>,

    /// Print the commands instead of running them
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Memory allowance per slot, in bytes
    #[arg(long = "max-memory")]
    pub max_memory: Option<u64>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SchedulerSection {
    jobs: Option<usize>,
    load: Option<f64>,
    max_memory: Option<u64>,
    max_buffer_size: Option<usize>,
    spinwait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OptionsSection {
    parallel: Option<u32>,
    n_threads: Option<u32>,
    valgrind: Option<ValgrindMode>,
    valgrind_suppressions: Option<PathBuf>,
    scaling: bool,
    mpi_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BatchSection {
    hpc: Option<Hpc>,
    file_timeout: Option<u64>,
    queue: Option<String>,
    qsub: Option<String>,
    qstat: Option<String>,
    qdel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    scheduler: SchedulerSection,
    options: OptionsSection,
    batch: BatchSection,
    tests: Vec<TestSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("test {0} is defined more than once")]
    DuplicateTest(String),
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub pbs: PbsConfig,
    pub wait_output_time: Duration,
}

/// Fully resolved settings: manifest values overridden by CLI flags and
/// the environment.
#[derive(Debug)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    /// Per-slot memory allowance handed to local runners.
    pub max_memory: Option<u64>,
    pub options: RunOptions,
    pub batch: Option<BatchConfig>,
    pub dry_run: bool,
    pub tests: Vec<TestSpec>,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&cli.manifest).map_err(|source| ConfigError::Read {
            path: cli.manifest.clone(),
            source,
        })?;
        let manifest: Manifest = toml::from_str(&text)?;
        let base_dir = cli
            .manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::resolve(cli, manifest, &base_dir, |var| std::env::var(var).ok())
    }

    pub fn resolve<F>(
        cli: &Cli,
        manifest: Manifest,
        base_dir: &Path,
        env: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Manifest {
            scheduler,
            options,
            batch,
            mut tests,
        } = manifest;

        let max_memory = cli.max_memory.or(scheduler.max_memory);
        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_processes: cli.jobs.or(scheduler.jobs).unwrap_or(defaults.max_processes),
            max_load: cli.load.or(scheduler.load).unwrap_or(defaults.max_load),
            spinwait_interval: scheduler
                .spinwait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.spinwait_interval),
            max_buffer_size: scheduler
                .max_buffer_size
                .unwrap_or(defaults.max_buffer_size),
            verbose: cli.verbose,
            ..defaults
        };

        let mut run_options = RunOptions {
            parallel: cli.parallel.or(options.parallel),
            threads: cli.n_threads.or(options.n_threads).unwrap_or(1),
            mpi_command: options
                .mpi_command
                .unwrap_or_else(|| DEFAULT_MPI_COMMAND.to_string()),
            valgrind_mode: cli.valgrind.or(options.valgrind).unwrap_or_default(),
            valgrind_suppressions: options
                .valgrind_suppressions
                .map(|path| base_dir.join(path)),
            scaling: cli.scaling || options.scaling,
            ..RunOptions::default()
        };
        if let Some(mpi_command) = env(MPI_COMMAND_ENV) {
            run_options.mpi_command = mpi_command;
            run_options.force_mpi = true;
        }
        if let Some(value) = env(MAX_TIME_ENV) {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: MAX_TIME_ENV,
                value: value.clone(),
            })?;
            run_options.default_max_time = Duration::from_secs(secs);
        }

        let batch = cli.hpc.or(batch.hpc).map(|Hpc::Pbs| BatchConfig {
            pbs: PbsConfig {
                qsub: batch.qsub.unwrap_or_else(|| "qsub".to_string()),
                qstat: batch.qstat.unwrap_or_else(|| "qstat".to_string()),
                qdel: batch.qdel.unwrap_or_else(|| "qdel".to_string()),
                queue: cli.pbs_queue.clone().or(batch.queue),
            },
            wait_output_time: cli
                .hpc_file_timeout
                .or(batch.file_timeout)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_WAIT_OUTPUT_TIME),
        });

        let mut seen = HashSet::new();
        for test in &mut tests {
            if !seen.insert(test.name.clone()) {
                return Err(ConfigError::DuplicateTest(test.name.clone()));
            }
            test.working_dir = Some(match &test.working_dir {
                Some(dir) => base_dir.join(dir),
                None => base_dir.to_path_buf(),
            });
        }

        Ok(Config {
            scheduler,
            max_memory,
            options: run_options,
            batch,
            dry_run: cli.dry_run,
            tests,
        })
    }
}
