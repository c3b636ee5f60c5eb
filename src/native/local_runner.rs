use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use sysinfo::{Pid, System};
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};

use crate::core::{
    domain::{Job, JobStatus, ResourceUsage, RunnerResult},
    timer::Timer,
    traits::runner::{Runner, RunnerError},
};

/// Runs the job's command through `sh -c` on this machine. Combined
/// stdout/stderr is spooled to a temporary file so it can be read while the
/// process is still running. The shell leads its own process group, so a
/// kill reaches everything it forked.
#[derive(Debug, Default)]
pub struct LocalRunner {
    max_memory: Option<u64>,
    child: Option<Child>,
    process_group: Option<nix::unistd::Pid>,
    output: Option<NamedTempFile>,
    exit_code: Option<i32>,
    system: System,
}

impl LocalRunner {
    pub fn new(max_memory: Option<u64>) -> Self {
        LocalRunner {
            max_memory,
            ..Self::default()
        }
    }
}

/// Exit code, or the negated signal number for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[async_trait::async_trait]
impl Runner for LocalRunner {
    #[tracing::instrument(skip(self, job, timer), fields(job = %job.name))]
    async fn spawn(&mut self, job: &Job, timer: &mut Timer) -> Result<(), RunnerError> {
        let io = |action| move |source| RunnerError::Io { action, source };

        let output = NamedTempFile::new().map_err(io("creating output file"))?;
        let stdout = output
            .as_file()
            .try_clone()
            .map_err(io("duplicating output handle"))?;
        let stderr = output
            .as_file()
            .try_clone()
            .map_err(io("duplicating output handle"))?;

        tracing::debug!("Spawning: command={:?} dir={:?}", job.command, job.working_dir);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::FailedToLaunch {
                command: job.command.clone(),
                source,
            })?;

        timer.start(Timer::RUNNER_RUN);
        self.process_group = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(nix::unistd::Pid::from_raw);
        self.child = Some(child);
        self.output = Some(output);
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<i32>, RunnerError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let child = self.child.as_mut().ok_or(RunnerError::NotSpawned)?;
        let status = child.try_wait().map_err(|source| RunnerError::Io {
            action: "polling process",
            source,
        })?;
        self.exit_code = status.map(exit_code);
        Ok(self.exit_code)
    }

    async fn wait(&mut self, timer: &mut Timer) -> Result<RunnerResult, RunnerError> {
        let child = self.child.as_mut().ok_or(RunnerError::NotSpawned)?;
        let status = child.wait().await.map_err(|source| RunnerError::Io {
            action: "waiting for process",
            source,
        })?;
        timer.stop(Timer::RUNNER_RUN)?;

        let exit_code = exit_code(status);
        self.exit_code = Some(exit_code);
        tracing::debug!("Process exited: exit_code={exit_code}");

        Ok(RunnerResult {
            exit_code,
            output: self.read_output().await?,
            status: JobStatus::Finished,
        })
    }

    async fn read_output(&mut self) -> Result<String, RunnerError> {
        let Some(output) = &self.output else {
            return Ok(String::new());
        };
        let bytes = tokio::fs::read(output.path())
            .await
            .map_err(|source| RunnerError::Io {
                action: "reading output",
                source,
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn kill(&mut self) -> Result<(), RunnerError> {
        // The group outlives its leader while forked children remain.
        if let Some(group) = self.process_group {
            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    return Err(RunnerError::Io {
                        action: "killing process group",
                        source: errno.into(),
                    });
                }
            }
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        // Already reaped.
        if child.id().is_none() {
            return Ok(());
        }
        let io = |action| move |source| RunnerError::Io { action, source };
        child.start_kill().map_err(io("killing process"))?;
        let status = child.wait().await.map_err(io("reaping process"))?;
        self.exit_code = Some(exit_code(status));
        Ok(())
    }

    fn resource_usage(&mut self) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(self.child.as_ref()?.id()?);
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|process| ResourceUsage {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }

    fn max_memory_usage(&self) -> Option<u64> {
        self.max_memory
    }
}
