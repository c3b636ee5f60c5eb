pub mod domain;
pub mod output;
pub mod scheduler;
pub mod tester;
pub mod timer;
pub mod traits;
