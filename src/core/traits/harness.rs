use crate::core::domain::{Job, JobReport};

/// Receives the outcome of every job the scheduler admitted into a slot.
#[mockall::automock]
pub trait Harness: Send {
    /// Called exactly once per admitted job.
    fn test_output_and_finish(&mut self, job: &Job, report: JobReport);

    /// Called for jobs whose prerequisite never finished.
    fn job_stranded(&mut self, job: &Job);
}
