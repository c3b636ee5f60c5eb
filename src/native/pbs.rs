use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::constants::BATCH_ENDING_COMMENT;
use crate::core::{
    domain::Job,
    traits::batch::{BatchError, BatchStatus, BatchSystem},
};

/// Queue binaries and submission defaults. The binaries are configurable
/// so tests and sites with wrappers can substitute their own.
#[derive(Clone, Debug)]
pub struct PbsConfig {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    pub queue: Option<String>,
}

impl Default for PbsConfig {
    fn default() -> Self {
        PbsConfig {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
            queue: None,
        }
    }
}

#[derive(Debug)]
pub struct PbsSystem {
    config: PbsConfig,
    state_regex: Regex,
    exit_regex: Regex,
    command_regex: Regex,
}

impl PbsSystem {
    pub fn new(config: PbsConfig) -> Result<Self, regex::Error> {
        Ok(PbsSystem {
            config,
            state_regex: Regex::new(r"(?m)^\s*job_state\s*=\s*(\w)")?,
            exit_regex: Regex::new(r"(?m)^\s*Exit_status\s*=\s*(-?\d+)")?,
            command_regex: Regex::new(r"(?m)^\s*Submit_arguments\s*=\s*(.+)$")?,
        })
    }

    fn base_name(job: &Job) -> String {
        job.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    fn script_path(job: &Job) -> PathBuf {
        job.working_dir.join(format!("{}.pbs", Self::base_name(job)))
    }

    pub fn submission_script(&self, job: &Job) -> String {
        let mut script = format!(
            "#!/bin/bash\n\
             #PBS -N {}\n\
             #PBS -l select={}:ncpus=1\n\
             #PBS -l walltime={}\n\
             #PBS -j oe\n\
             #PBS -o {}\n",
            Self::base_name(job),
            job.slots.max(1),
            walltime(job.max_time),
            self.output_path(job).display(),
        );
        if let Some(queue) = &self.config.queue {
            script.push_str(&format!("#PBS -q {queue}\n"));
        }
        script.push_str(&format!(
            "\ncd {}\n{}\nstatus=$?\necho\necho \"{}\"\nexit $status\n",
            job.working_dir.display(),
            job.command,
            self.ending_comment(),
        ));
        script
    }

    pub fn parse_status(&self, qstat: &str) -> Result<BatchStatus, BatchError> {
        let state = self
            .state_regex
            .captures(qstat)
            .and_then(|c| c.get(1))
            .ok_or_else(|| BatchError::Parse("no job_state in qstat output".to_string()))?
            .as_str();
        let exit_code = self
            .exit_regex
            .captures(qstat)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        let command_ran = self
            .command_regex
            .captures(qstat)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());

        Ok(BatchStatus {
            // Torque reports C, PBS Pro reports F.
            done: matches!(state, "F" | "C"),
            exit_code,
            command_ran,
        })
    }

    async fn run(&self, program: &str, args: &[&str], dir: Option<&Path>) -> Result<String, BatchError> {
        let command = format!("{program} {}", args.join(" "));
        tracing::trace!("Running queue command: {command}");

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await.map_err(|source| BatchError::Command {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `HH:MM:SS`, rounded up to whole seconds.
fn walltime(max_time: Duration) -> String {
    let secs = max_time
        .as_secs()
        .saturating_add(u64::from(max_time.subsec_nanos() > 0));
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

#[async_trait::async_trait]
impl BatchSystem for PbsSystem {
    async fn submit(&self, job: &Job) -> Result<String, BatchError> {
        let script_path = Self::script_path(job);
        tokio::fs::write(&script_path, self.submission_script(job)).await?;
        tracing::debug!("Created submission script: {script_path:?}");

        let script = script_path.display().to_string();
        let stdout = self
            .run(&self.config.qsub, &[&script], Some(&job.working_dir))
            .await?;
        let batch_id = stdout.trim();
        if batch_id.is_empty() {
            return Err(BatchError::Parse("qsub printed no job id".to_string()));
        }
        Ok(batch_id.to_string())
    }

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let stdout = self.run(&self.config.qstat, &["-xf", batch_id], None).await?;
        self.parse_status(&stdout)
    }

    fn output_path(&self, job: &Job) -> PathBuf {
        job.working_dir.join(format!("{}.o", Self::base_name(job)))
    }

    fn ending_comment(&self) -> String {
        BATCH_ENDING_COMMENT.to_string()
    }

    async fn kill(&self, batch_id: &str) -> Result<(), BatchError> {
        self.run(&self.config.qdel, &[batch_id], None).await?;
        Ok(())
    }
}
