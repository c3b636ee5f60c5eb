use crate::core::domain::{Job, ResourceUsage, RunnerResult};
use crate::core::timer::{Timer, TimerError};
use crate::core::traits::batch::BatchError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch `{command}`: {source}")]
    FailedToLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runner has not been spawned")]
    NotSpawned,
    #[error("i/o error while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Execution strategy for one job. A runner is used for exactly one job:
/// `spawn` once, poll with `try_wait`, then either `wait` or `kill`.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send {
    /// Starts the job and the `runner_run` timer without waiting for it.
    async fn spawn(&mut self, job: &Job, timer: &mut Timer) -> Result<(), RunnerError>;

    /// Non-blocking completion check; `Some(exit_code)` once the job ended.
    async fn try_wait(&mut self) -> Result<Option<i32>, RunnerError>;

    /// Blocks until the job ended, stops the timer and collects the output.
    async fn wait(&mut self, timer: &mut Timer) -> Result<RunnerResult, RunnerError>;

    /// Output captured so far, even while the job is still running.
    async fn read_output(&mut self) -> Result<String, RunnerError>;

    /// Best-effort forced termination.
    async fn kill(&mut self) -> Result<(), RunnerError>;

    fn resource_usage(&mut self) -> Option<ResourceUsage>;

    /// Per-slot memory allowance in bytes; `None` disables policing.
    fn max_memory_usage(&self) -> Option<u64>;
}

/// Kills the runner when its sampled memory exceeds `slots` times the
/// runner's own allowance. Returns whether the job was terminated for
/// oversubscription.
pub async fn check_resource_usage(runner: &mut dyn Runner, slots: u32) -> Result<bool, RunnerError> {
    let Some(usage) = runner.resource_usage() else {
        return Ok(false);
    };
    let Some(max_memory) = runner.max_memory_usage() else {
        return Ok(false);
    };

    let allowance = max_memory.saturating_mul(u64::from(slots.max(1)));
    if usage.memory_bytes <= allowance {
        return Ok(false);
    }

    tracing::warn!(
        memory_bytes = usage.memory_bytes,
        allowance,
        "job exceeded its memory allowance, terminating"
    );
    runner.kill().await?;
    Ok(true)
}
