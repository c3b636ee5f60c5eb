use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::constants::{DEFAULT_BATCH_POLL, DEFAULT_WAIT_OUTPUT_TIME, RUNNER_ERROR_EXIT_CODE};
use crate::core::{
    domain::{Job, JobStatus, ResourceUsage, RunnerResult},
    output::{append_output, output_header},
    timer::Timer,
    traits::{
        batch::BatchSystem,
        runner::{Runner, RunnerError},
    },
};

/// Runs a job through an HPC queue. Completion is polled from the queue;
/// the output is only trusted once every expected file exists and the
/// queue's output file ends with the terminator line. Both checks happen in
/// `try_wait`, so a job waiting on a slow filesystem never holds up the
/// caller.
#[derive(Debug)]
pub struct BatchRunner {
    batch: Arc<dyn BatchSystem>,
    wait_output_time: Duration,
    poll_interval: Duration,
    job: Option<Job>,
    batch_id: Option<String>,
    exit_code: Option<i32>,
    last_poll: Option<Instant>,
    output_deadline: Option<Instant>,
    missing: Option<Vec<PathBuf>>,
}

impl BatchRunner {
    pub fn new(batch: Arc<dyn BatchSystem>) -> Self {
        BatchRunner {
            batch,
            wait_output_time: DEFAULT_WAIT_OUTPUT_TIME,
            poll_interval: DEFAULT_BATCH_POLL,
            job: None,
            batch_id: None,
            exit_code: None,
            last_poll: None,
            output_deadline: None,
            missing: None,
        }
    }

    pub fn with_wait_output_time(self, wait_output_time: Duration) -> Self {
        Self {
            wait_output_time,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    fn batch_id(&self) -> Result<&str, RunnerError> {
        self.batch_id.as_deref().ok_or(RunnerError::NotSpawned)
    }

    /// Asks the queue for the job's state at most once per poll interval.
    /// Returns the exit code once the queue reports the job done.
    async fn poll_queue(&mut self) -> Result<Option<i32>, RunnerError> {
        if let Some(exit_code) = self.exit_code {
            return Ok(Some(exit_code));
        }
        let now = Instant::now();
        if self
            .last_poll
            .is_some_and(|last| now.duration_since(last) < self.poll_interval)
        {
            return Ok(None);
        }
        let status = self.batch.status(self.batch_id()?).await?;
        self.last_poll = Some(now);
        if !status.done {
            return Ok(None);
        }
        if let Some(command) = &status.command_ran {
            tracing::debug!("Batch job finished: command={command:?}");
        }
        let exit_code = status.exit_code.unwrap_or(RUNNER_ERROR_EXIT_CODE);
        self.exit_code = Some(exit_code);
        self.output_deadline = Some(
            now.checked_add(self.wait_output_time)
                .unwrap_or_else(|| now + DEFAULT_WAIT_OUTPUT_TIME),
        );
        Ok(Some(exit_code))
    }

    /// Expected files that are missing. The queue's output file counts as
    /// missing until its last line is the terminator.
    async fn missing_files(&self, job: &Job) -> Vec<PathBuf> {
        let mut missing = Vec::new();

        let output_path = self.batch.output_path(job);
        let ending = self.batch.ending_comment();
        let complete = tokio::fs::read_to_string(&output_path)
            .await
            .is_ok_and(|output| output.lines().rev().find(|l| !l.trim().is_empty()) == Some(ending.as_str()));
        if !complete {
            missing.push(output_path);
        }

        for file in &job.output_files {
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                missing.push(file.clone());
            }
        }
        missing
    }
}

#[async_trait::async_trait]
impl Runner for BatchRunner {
    #[tracing::instrument(skip(self, job, timer), fields(job = %job.name))]
    async fn spawn(&mut self, job: &Job, timer: &mut Timer) -> Result<(), RunnerError> {
        let batch_id = self.batch.submit(job).await?;
        tracing::info!("Submitted to batch queue: batch_id={batch_id}");

        timer.start(Timer::RUNNER_RUN);
        self.job = Some(job.clone());
        self.batch_id = Some(batch_id);
        Ok(())
    }

    /// `None` until the queue reports the job done and its output files are
    /// complete, or until the output wait runs out.
    async fn try_wait(&mut self) -> Result<Option<i32>, RunnerError> {
        if self.missing.is_some() {
            return Ok(self.exit_code);
        }
        let Some(exit_code) = self.poll_queue().await? else {
            return Ok(None);
        };

        let job = self.job.clone().ok_or(RunnerError::NotSpawned)?;
        let missing = self.missing_files(&job).await;
        let expired = self
            .output_deadline
            .is_none_or(|deadline| Instant::now() >= deadline);
        if !missing.is_empty() && !expired {
            return Ok(None);
        }
        if !missing.is_empty() {
            tracing::warn!("Output files never appeared: missing={missing:?}");
        }
        self.missing = Some(missing);
        Ok(Some(exit_code))
    }

    async fn wait(&mut self, timer: &mut Timer) -> Result<RunnerResult, RunnerError> {
        let exit_code = loop {
            if let Some(exit_code) = self.try_wait().await? {
                break exit_code;
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        timer.stop(Timer::RUNNER_RUN)?;

        let missing = self.missing.clone().unwrap_or_default();
        let mut output = self.read_output().await?;
        if missing.is_empty() {
            return Ok(RunnerResult {
                exit_code,
                output,
                status: JobStatus::Finished,
            });
        }

        let listing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        append_output(
            &mut output,
            &output_header(&format!(
                "Timed out waiting for output files:\n{}",
                listing.join("\n")
            )),
        );
        Ok(RunnerResult {
            exit_code,
            output,
            status: JobStatus::FileTimeout { missing },
        })
    }

    async fn read_output(&mut self) -> Result<String, RunnerError> {
        let Some(job) = &self.job else {
            return Ok(String::new());
        };
        let output = match tokio::fs::read(self.batch.output_path(job)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(source) => {
                return Err(RunnerError::Io {
                    action: "reading batch output",
                    source,
                });
            }
        };

        let ending = self.batch.ending_comment();
        Ok(output
            .lines()
            .filter(|line| *line != ending)
            .map(|line| format!("{line}\n"))
            .collect())
    }

    async fn kill(&mut self) -> Result<(), RunnerError> {
        let Some(batch_id) = &self.batch_id else {
            return Ok(());
        };
        self.batch.kill(batch_id).await?;
        Ok(())
    }

    fn resource_usage(&mut self) -> Option<ResourceUsage> {
        None
    }

    fn max_memory_usage(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mockall::predicate::eq;

    use super::*;
    use crate::core::traits::batch::{BatchStatus, MockBatchSystem};

    const ENDING: &str = "END OF OUTPUT";

    fn batch_system(dir: &Path, polls_until_done: usize, exit_code: i32) -> MockBatchSystem {
        let output_path = dir.join("job.out");
        let polls = AtomicUsize::new(0);

        let mut batch = MockBatchSystem::new();
        batch
            .expect_submit()
            .times(1)
            .returning(|_| Ok("1234.pbs".to_string()));
        batch
            .expect_status()
            .with(eq("1234.pbs"))
            .returning(move |_| {
                let done = polls.fetch_add(1, Ordering::SeqCst) + 1 >= polls_until_done;
                Ok(BatchStatus {
                    done,
                    exit_code: done.then_some(exit_code),
                    command_ran: None,
                })
            });
        batch
            .expect_output_path()
            .returning(move |_| output_path.clone());
        batch
            .expect_ending_comment()
            .returning(|| ENDING.to_string());
        batch
    }

    fn runner(batch: MockBatchSystem) -> BatchRunner {
        BatchRunner::new(Arc::new(batch))
            .with_poll_interval(Duration::from_millis(5))
            .with_wait_output_time(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_completed_job_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.out"), format!("solve ok\n{ENDING}\n")).unwrap();
        std::fs::write(dir.path().join("out.e"), "exodus").unwrap();

        let mut runner = runner(batch_system(dir.path(), 3, 0));
        let mut job = Job::new("batch", "./app -i in.i");
        job.output_files = vec![dir.path().join("out.e")];

        let mut timer = Timer::new();
        runner.spawn(&job, &mut timer).await.unwrap();
        assert_eq!(runner.try_wait().await.unwrap(), None);

        let result = runner.wait(&mut timer).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "solve ok\n");
        assert_eq!(result.status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_missing_output_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.out"), format!("solve ok\n{ENDING}\n")).unwrap();

        let mut runner = runner(batch_system(dir.path(), 1, 0));
        let mut job = Job::new("batch", "./app -i in.i");
        job.output_files = vec![dir.path().join("never.e")];

        let mut timer = Timer::new();
        runner.spawn(&job, &mut timer).await.unwrap();
        let result = runner.wait(&mut timer).await.unwrap();

        assert_eq!(
            result.status,
            JobStatus::FileTimeout {
                missing: vec![dir.path().join("never.e")]
            }
        );
        assert!(result.output.contains("never.e"));
    }

    #[tokio::test]
    async fn test_unterminated_output_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.out"), "half written").unwrap();

        let mut runner = runner(batch_system(dir.path(), 1, 0));
        let mut timer = Timer::new();
        runner
            .spawn(&Job::new("batch", "./app"), &mut timer)
            .await
            .unwrap();
        let result = runner.wait(&mut timer).await.unwrap();

        assert_eq!(
            result.status,
            JobStatus::FileTimeout {
                missing: vec![dir.path().join("job.out")]
            }
        );
    }

    #[tokio::test]
    async fn test_try_wait_holds_until_output_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = BatchRunner::new(Arc::new(batch_system(dir.path(), 1, 0)))
            .with_poll_interval(Duration::from_millis(5))
            .with_wait_output_time(Duration::from_secs(30));
        let mut timer = Timer::new();
        runner
            .spawn(&Job::new("batch", "./app"), &mut timer)
            .await
            .unwrap();

        // Queue says done, output not yet flushed: no blocking, no result.
        let started = Instant::now();
        assert_eq!(runner.try_wait().await.unwrap(), None);
        assert_eq!(runner.try_wait().await.unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(1));

        std::fs::write(dir.path().join("job.out"), format!("late\n{ENDING}\n")).unwrap();
        assert_eq!(runner.try_wait().await.unwrap(), Some(0));

        let result = runner.wait(&mut timer).await.unwrap();
        assert_eq!(result.status, JobStatus::Finished);
        assert_eq!(result.output, "late\n");
    }

    #[tokio::test]
    async fn test_kill_forwards_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = batch_system(dir.path(), 100, 0);
        batch
            .expect_kill()
            .with(eq("1234.pbs"))
            .times(1)
            .returning(|_| Ok(()));

        let mut runner = runner(batch);
        let mut timer = Timer::new();
        runner
            .spawn(&Job::new("batch", "./app"), &mut timer)
            .await
            .unwrap();
        runner.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_spawned() {
        let mut runner = runner(MockBatchSystem::new());
        assert!(matches!(
            runner.try_wait().await,
            Err(RunnerError::NotSpawned)
        ));
    }
}
