//! Implementations of the core traits that talk to the operating system or
//! to an HPC queue.
pub mod batch_runner;
pub mod load;
pub mod local_runner;
pub mod pbs;
