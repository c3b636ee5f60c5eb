use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// One schedulable test invocation. Immutable once handed to the scheduler.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub prerequisite: Option<String>,
    pub max_time: Duration,
    /// Processes times threads; scales the per-job memory allowance.
    pub slots: u32,
    /// Files the job is expected to produce, checked by batch runners.
    pub output_files: Vec<PathBuf>,
    /// Set when the captured output must not be trimmed.
    pub full_output: bool,
}

impl Job {
    pub fn new(name: &str, command: &str) -> Self {
        Job {
            id: Uuid::new_v4(),
            name: name.to_string(),
            command: command.to_string(),
            working_dir: PathBuf::from("."),
            prerequisite: None,
            max_time: Duration::from_secs(crate::constants::DEFAULT_MAX_TIME_SECS),
            slots: 1,
            output_files: Vec::new(),
            full_output: false,
        }
    }

    pub fn with_prerequisite(self, prerequisite: &str) -> Self {
        Self {
            prerequisite: Some(prerequisite.to_string()),
            ..self
        }
    }

    pub fn with_max_time(self, max_time: Duration) -> Self {
        Self { max_time, ..self }
    }

    pub fn in_dir<P: Into<PathBuf>>(self, working_dir: P) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..self
        }
    }
}

/// How a job's execution ended, as seen by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Finished,
    Timeout,
    FileTimeout { missing: Vec<PathBuf> },
    ExceededMemory,
    Error { msg: String },
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Timeout => write!(f, "TIMEOUT"),
            JobStatus::FileTimeout { .. } => write!(f, "FILE TIMEOUT"),
            JobStatus::ExceededMemory => write!(f, "EXCEEDED MEM"),
            JobStatus::Error { .. } => write!(f, "RUNNER ERROR"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerResult {
    pub exit_code: i32,
    pub output: String,
    pub status: JobStatus,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// What the harness receives, exactly once per admitted job.
#[derive(Clone, Debug)]
pub struct JobReport {
    pub exit_code: i32,
    pub output: String,
    pub status: JobStatus,
    pub elapsed: Duration,
    pub slot: usize,
}
