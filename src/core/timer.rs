use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("missing time entry {0}")]
    Missing(String),
    #[error("time entry {0} already stopped")]
    AlreadyStopped(String),
}

/// Named wall-clock timers for the phases of a job.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    times: HashMap<String, (Instant, Option<Instant>)>,
}

impl Timer {
    pub const MAIN: &'static str = "main";
    pub const RUNNER_RUN: &'static str = "runner_run";

    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the named timer.
    pub fn start(&mut self, name: &str) {
        self.times.insert(name.to_string(), (Instant::now(), None));
    }

    pub fn stop(&mut self, name: &str) -> Result<(), TimerError> {
        let entry = self
            .times
            .get_mut(name)
            .ok_or_else(|| TimerError::Missing(name.to_string()))?;
        if entry.1.is_some() {
            return Err(TimerError::AlreadyStopped(name.to_string()));
        }
        entry.1 = Some(Instant::now());
        Ok(())
    }

    pub fn is_stopped(&self, name: &str) -> bool {
        matches!(self.times.get(name), Some((_, Some(_))))
    }

    /// Elapsed time of the named timer; a running timer is measured up to now.
    pub fn total(&self, name: &str) -> Result<Duration, TimerError> {
        match self.times.get(name) {
            Some((start, Some(end))) => Ok(end.duration_since(*start)),
            Some((start, None)) => Ok(start.elapsed()),
            None => Err(TimerError::Missing(name.to_string())),
        }
    }

    /// Run time if the runner timer exists, else the main timer, else zero.
    pub fn timing(&self) -> Duration {
        self.total(Self::RUNNER_RUN)
            .or_else(|_| self.total(Self::MAIN))
            .unwrap_or_default()
    }
}
