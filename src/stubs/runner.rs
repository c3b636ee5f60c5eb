use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::{
    domain::{Job, JobStatus, ResourceUsage, RunnerResult},
    timer::Timer,
    traits::runner::{Runner, RunnerError},
};

/// Runner that executes nothing: it "finishes" `delay` after spawning with a
/// canned exit code and output. Backs `--dry-run` and scheduler tests.
#[derive(Debug, Clone)]
pub struct RunnerStub {
    exit_code: i32,
    output: String,
    delay: Duration,
    echo_command: bool,
    started: Option<Instant>,
    killed: Arc<AtomicBool>,
}

impl RunnerStub {
    pub fn new(exit_code: i32, output: &str, delay: Duration) -> Self {
        Self {
            exit_code,
            output: output.to_string(),
            delay,
            echo_command: false,
            started: None,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Succeeds immediately, reporting the command it would have run.
    pub fn dry_run() -> Self {
        Self {
            echo_command: true,
            ..Self::new(0, "", Duration::ZERO)
        }
    }

    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        self.killed.clone()
    }

    fn is_done(&self) -> bool {
        self.started
            .is_some_and(|started| started.elapsed() >= self.delay)
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    #[tracing::instrument(skip(self, job, timer), fields(job = %job.name))]
    async fn spawn(&mut self, job: &Job, timer: &mut Timer) -> Result<(), RunnerError> {
        tracing::debug!("Start stub execution: command={:?}", job.command);
        if self.echo_command {
            self.output = format!("DRY RUN: {}\n", job.command);
        }
        timer.start(Timer::RUNNER_RUN);
        self.started = Some(Instant::now());
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<i32>, RunnerError> {
        if self.started.is_none() {
            return Err(RunnerError::NotSpawned);
        }
        Ok(self.is_done().then_some(self.exit_code))
    }

    async fn wait(&mut self, timer: &mut Timer) -> Result<RunnerResult, RunnerError> {
        let started = self.started.ok_or(RunnerError::NotSpawned)?;
        tokio::time::sleep_until(started + self.delay).await;
        timer.stop(Timer::RUNNER_RUN)?;
        tracing::debug!("Stub result: exit_code={}", self.exit_code);

        Ok(RunnerResult {
            exit_code: self.exit_code,
            output: self.output.clone(),
            status: JobStatus::Finished,
        })
    }

    async fn read_output(&mut self) -> Result<String, RunnerError> {
        Ok(self.output.clone())
    }

    async fn kill(&mut self) -> Result<(), RunnerError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resource_usage(&mut self) -> Option<ResourceUsage> {
        None
    }

    fn max_memory_usage(&self) -> Option<u64> {
        None
    }
}
