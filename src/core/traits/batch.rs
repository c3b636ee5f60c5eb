use std::path::PathBuf;

use crate::core::domain::Job;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to run `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("unexpected batch scheduler output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchStatus {
    pub done: bool,
    pub exit_code: Option<i32>,
    pub command_ran: Option<String>,
}

/// Accessor for an HPC queue (submit, poll, locate output, kill).
#[mockall::automock]
#[async_trait::async_trait]
pub trait BatchSystem: std::fmt::Debug + Send + Sync {
    /// Submits the job and returns the queue's identifier for it.
    async fn submit(&self, job: &Job) -> Result<String, BatchError>;

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError>;

    /// Where the queue redirects the job's combined stdout/stderr.
    fn output_path(&self, job: &Job) -> PathBuf;

    /// Final line of a completely flushed output file.
    fn ending_comment(&self) -> String;

    async fn kill(&self, batch_id: &str) -> Result<(), BatchError>;
}
