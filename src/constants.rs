use std::time::Duration;

/// Exit code reported for a job the scheduler had to terminate.
pub const TIMEOUT_EXIT_CODE: i32 = -999999;

/// Exit code reported when a runner failed after its process was launched.
pub const RUNNER_ERROR_EXIT_CODE: i32 = -1;

pub const TERMINATED_BANNER: &str = "Process terminated by test harness";

pub const TRIMMED_BANNER: &str = "Output trimmed";

pub const DEFAULT_SPINWAIT: Duration = Duration::from_millis(50);
pub const DEFAULT_LOAD_POLL: Duration = Duration::from_millis(500);

pub const DEFAULT_MAX_TIME_SECS: u64 = 300;
/// Deadline used when a job's time limit does not fit the clock.
pub const UNBOUNDED_MAX_TIME: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
pub const MAX_TIME_ENV: &str = "TESTRUNNER_MAX_TIME";

pub const MPI_COMMAND_ENV: &str = "TESTRUNNER_MPI_COMMAND";
pub const DEFAULT_MPI_COMMAND: &str = "mpiexec";

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100_000;

pub const DEFAULT_WAIT_OUTPUT_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_POLL: Duration = Duration::from_secs(1);

/// Last line written by every batch submission script.
pub const BATCH_ENDING_COMMENT: &str = "TESTRUNNER BATCH OUTPUT TERMINATOR";

pub const MEMCHECK_CLEAN_SUMMARY: &str = "ERROR SUMMARY: 0 errors";

pub const DEFAULT_ERRORS: [&str; 3] = [
    "ERROR",
    "command not found",
    "terminate called after throwing an instance of",
];
