pub mod batch;
pub mod harness;
pub mod load;
pub mod runner;
