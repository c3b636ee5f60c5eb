use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::constants::{
    DEFAULT_LOAD_POLL, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_SPINWAIT, RUNNER_ERROR_EXIT_CODE,
    TERMINATED_BANNER, TIMEOUT_EXIT_CODE, UNBOUNDED_MAX_TIME,
};
use crate::core::domain::{Job, JobReport, JobStatus, RunnerResult};
use crate::core::output::{append_output, output_header, trim_output};
use crate::core::timer::Timer;
use crate::core::traits::harness::Harness;
use crate::core::traits::load::LoadSource;
use crate::core::traits::runner::{Runner, RunnerError, check_resource_usage};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_processes: usize,
    /// Load average at or above which new jobs wait for running ones.
    pub max_load: f64,
    pub spinwait_interval: Duration,
    pub load_poll_interval: Duration,
    /// Captured output beyond this many bytes is trimmed; zero disables.
    pub max_buffer_size: usize,
    pub verbose: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_processes: 1,
            max_load: 64.0,
            spinwait_interval: DEFAULT_SPINWAIT,
            load_poll_interval: DEFAULT_LOAD_POLL,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            verbose: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler needs at least one slot")]
    NoSlots,
    #[error("failed to spawn job {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: RunnerError,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SchedulerEvent {
    Queued { name: String },
    Started { name: String, slot: usize },
    Finished {
        name: String,
        slot: usize,
        exit_code: i32,
        status: JobStatus,
    },
    Skipped { name: String },
    Stranded { name: String },
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerEvent::Queued { name } => write!(f, "queued {name}"),
            SchedulerEvent::Started { name, slot } => write!(f, "started {name} in slot {slot}"),
            SchedulerEvent::Finished {
                name,
                slot,
                exit_code,
                status,
            } => write!(
                f,
                "finished {name} in slot {slot}: exit_code={exit_code} status={status}"
            ),
            SchedulerEvent::Skipped { name } => write!(f, "skipped {name}"),
            SchedulerEvent::Stranded { name } => write!(f, "stranded {name}"),
        }
    }
}

/// Per-scheduler record of admissions and completions.
#[derive(Debug, Default)]
pub struct SchedulerLog {
    verbose: bool,
    entries: Vec<(DateTime<Utc>, SchedulerEvent)>,
}

impl SchedulerLog {
    pub fn new(verbose: bool) -> Self {
        SchedulerLog {
            verbose,
            entries: Vec::new(),
        }
    }

    fn record(&mut self, event: SchedulerEvent) {
        tracing::debug!(?event, "scheduler event");
        self.entries.push((Utc::now(), event));
    }

    /// One line per event, stamped with the wall-clock time it was recorded.
    /// Empty unless the log is verbose.
    pub fn timeline(&self) -> Vec<String> {
        if !self.verbose {
            return Vec::new();
        }
        self.entries
            .iter()
            .map(|(at, event)| format!("{} {event}", at.format("%H:%M:%S%.3f")))
            .collect()
    }

    pub fn events(&self) -> impl Iterator<Item = &SchedulerEvent> {
        self.entries.iter().map(|(_, event)| event)
    }
}

/// `now + max_time`, or a far-future deadline when that overflows the clock.
fn deadline(now: Instant, max_time: Duration) -> Instant {
    now.checked_add(max_time)
        .or_else(|| now.checked_add(UNBOUNDED_MAX_TIME))
        .unwrap_or(now)
}

struct Pending {
    job: Job,
    runner: Box<dyn Runner>,
}

struct Slot {
    job: Job,
    runner: Box<dyn Runner>,
    timer: Timer,
    expires_at: Instant,
    exceeded_memory: bool,
}

/// Bounded pool of concurrently running jobs with prerequisite ordering and
/// load-average admission control.
///
/// Everything runs on the caller's task: jobs make progress only while one of
/// `run`, `spinwait` or `join` is being awaited. Completions never start jobs
/// directly; they move unblocked jobs onto the ready queue, which only
/// `run`/`join` drain.
pub struct Scheduler<H: Harness> {
    config: SchedulerConfig,
    harness: H,
    load: Arc<dyn LoadSource>,
    slots: Vec<Option<Slot>>,
    waiting: VecDeque<Pending>,
    ready: VecDeque<Pending>,
    finished: HashSet<String>,
    stranded: Vec<Job>,
    log: SchedulerLog,
}

impl<H: Harness> Scheduler<H> {
    pub fn new(
        config: SchedulerConfig,
        harness: H,
        load: Arc<dyn LoadSource>,
    ) -> Result<Self, SchedulerError> {
        if config.max_processes == 0 {
            return Err(SchedulerError::NoSlots);
        }
        let slots = (0..config.max_processes).map(|_| None).collect();
        let log = SchedulerLog::new(config.verbose);
        Ok(Scheduler {
            config,
            harness,
            load,
            slots,
            waiting: VecDeque::new(),
            ready: VecDeque::new(),
            finished: HashSet::new(),
            stranded: Vec::new(),
            log,
        })
    }

    /// Admits a job, or queues it behind its unfinished prerequisite.
    /// Blocks while the load gate is closed or every slot is busy.
    #[tracing::instrument(skip(self, job, runner), fields(job = %job.name))]
    pub async fn run(&mut self, job: Job, runner: Box<dyn Runner>) -> Result<(), SchedulerError> {
        self.ready.push_back(Pending { job, runner });
        self.drain_ready().await
    }

    /// Admits every waiting job whose prerequisite has finished.
    pub async fn start_ready_jobs(&mut self) -> Result<(), SchedulerError> {
        self.promote_waiting();
        self.drain_ready().await
    }

    /// Polls occupied slots once and finalizes the first finished, expired
    /// or oversubscribed one, then sleeps for `time_to_wait`.
    pub async fn spinwait(&mut self, time_to_wait: Duration) {
        let now = Instant::now();
        let mut done = None;

        for (idx, entry) in self.slots.iter_mut().enumerate() {
            let Some(slot) = entry.as_mut() else {
                continue;
            };

            match slot.runner.try_wait().await {
                Ok(Some(_)) => {
                    done = Some(idx);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(job = %slot.job.name, error = %e, "failed to poll job");
                    done = Some(idx);
                    break;
                }
            }

            if now >= slot.expires_at {
                done = Some(idx);
                break;
            }

            match check_resource_usage(slot.runner.as_mut(), slot.job.slots).await {
                Ok(true) => {
                    slot.exceeded_memory = true;
                    done = Some(idx);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job = %slot.job.name, error = %e, "failed to check resource usage");
                }
            }
        }

        if let Some(idx) = done {
            self.return_to_test_harness(idx).await;
        }
        tokio::time::sleep(time_to_wait).await;
    }

    /// Blocks until no job is running or ready. Jobs still waiting on a
    /// prerequisite at that point can never run and are reported as stranded.
    pub async fn join(&mut self) -> Result<(), SchedulerError> {
        loop {
            self.start_ready_jobs().await?;
            if self.all_slots_free() {
                break;
            }
            self.spinwait(self.config.spinwait_interval).await;
        }

        while let Some(Pending { job, .. }) = self.waiting.pop_front() {
            tracing::warn!(
                job = %job.name,
                prerequisite = job.prerequisite.as_deref().unwrap_or_default(),
                "prerequisite never finished"
            );
            self.log.record(SchedulerEvent::Stranded {
                name: job.name.clone(),
            });
            self.harness.job_stranded(&job);
            self.stranded.push(job);
        }
        Ok(())
    }

    /// Waits while the system is loaded and something is still running.
    /// Returns immediately once every slot is free, whatever the load.
    pub async fn satisfy_load(&mut self) {
        while !self.all_slots_free() && self.load.load_average() >= self.config.max_load {
            tracing::debug!(max_load = self.config.max_load, "load average too high, waiting");
            self.spinwait(self.config.load_poll_interval).await;
        }
    }

    /// Marks a job that will never run as finished so its dependents can.
    pub fn job_skipped(&mut self, name: &str) {
        self.finished.insert(name.to_string());
        self.log.record(SchedulerEvent::Skipped {
            name: name.to_string(),
        });
        self.promote_waiting();
    }

    pub fn is_finished(&self, name: &str) -> bool {
        self.finished.contains(name)
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn stranded(&self) -> &[Job] {
        &self.stranded
    }

    pub fn log(&self) -> &SchedulerLog {
        &self.log
    }

    pub fn harness(&self) -> &H {
        &self.harness
    }

    pub fn into_harness(self) -> H {
        self.harness
    }

    fn all_slots_free(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn prerequisite_met(&self, job: &Job) -> bool {
        job.prerequisite
            .as_ref()
            .is_none_or(|prerequisite| self.finished.contains(prerequisite))
    }

    async fn drain_ready(&mut self) -> Result<(), SchedulerError> {
        while let Some(pending) = self.ready.pop_front() {
            self.satisfy_load().await;

            if !self.prerequisite_met(&pending.job) {
                self.log.record(SchedulerEvent::Queued {
                    name: pending.job.name.clone(),
                });
                self.waiting.push_back(pending);
                continue;
            }

            match self.free_slot() {
                Some(idx) => self.occupy(idx, pending).await?,
                None => {
                    let before = self.ready.len();
                    self.spinwait(self.config.spinwait_interval).await;
                    // Jobs unblocked by that completion go ahead of this one.
                    let unblocked: Vec<Pending> = self.ready.drain(before..).collect();
                    self.ready.push_front(pending);
                    for pending in unblocked.into_iter().rev() {
                        self.ready.push_front(pending);
                    }
                }
            }
        }
        Ok(())
    }

    async fn occupy(&mut self, idx: usize, pending: Pending) -> Result<(), SchedulerError> {
        let Pending { job, mut runner } = pending;
        let mut timer = Timer::new();
        timer.start(Timer::MAIN);

        runner
            .spawn(&job, &mut timer)
            .await
            .map_err(|source| SchedulerError::Spawn {
                name: job.name.clone(),
                source,
            })?;

        self.log.record(SchedulerEvent::Started {
            name: job.name.clone(),
            slot: idx,
        });
        self.slots[idx] = Some(Slot {
            expires_at: deadline(Instant::now(), job.max_time),
            job,
            runner,
            timer,
            exceeded_memory: false,
        });
        Ok(())
    }

    /// Moves a snapshot of the wait-queue: unblocked jobs become ready,
    /// the rest go back to waiting.
    fn promote_waiting(&mut self) {
        for _ in 0..self.waiting.len() {
            let Some(pending) = self.waiting.pop_front() else {
                break;
            };
            if self.prerequisite_met(&pending.job) {
                self.ready.push_back(pending);
            } else {
                self.waiting.push_back(pending);
            }
        }
    }

    async fn return_to_test_harness(&mut self, idx: usize) {
        let Some(mut slot) = self.slots[idx].take() else {
            return;
        };

        let result = if slot.exceeded_memory {
            let mut result = self.collect(&mut slot).await;
            result.status = JobStatus::ExceededMemory;
            result
        } else if matches!(slot.runner.try_wait().await, Ok(None)) {
            self.terminate(&mut slot).await
        } else {
            self.collect(&mut slot).await
        };

        if let Err(e) = slot.timer.stop(Timer::MAIN) {
            tracing::debug!(job = %slot.job.name, error = %e, "main timer not running");
        }
        let report = JobReport {
            exit_code: result.exit_code,
            output: result.output,
            status: result.status,
            elapsed: slot.timer.timing(),
            slot: idx,
        };

        self.finished.insert(slot.job.name.clone());
        self.log.record(SchedulerEvent::Finished {
            name: slot.job.name.clone(),
            slot: idx,
            exit_code: report.exit_code,
            status: report.status.clone(),
        });
        self.harness.test_output_and_finish(&slot.job, report);
        self.promote_waiting();
    }

    async fn collect(&self, slot: &mut Slot) -> RunnerResult {
        match slot.runner.wait(&mut slot.timer).await {
            Ok(result) => RunnerResult {
                output: self.trim(&slot.job, result.output),
                ..result
            },
            Err(e) => {
                tracing::error!(job = %slot.job.name, error = %e, "runner failed");
                let mut output = match slot.runner.read_output().await {
                    Ok(output) => self.trim(&slot.job, output),
                    Err(_) => String::new(),
                };
                append_output(&mut output, &output_header("Runner failure"));
                append_output(&mut output, &format!("{e}\n"));
                RunnerResult {
                    exit_code: RUNNER_ERROR_EXIT_CODE,
                    output,
                    status: JobStatus::Error { msg: e.to_string() },
                }
            }
        }
    }

    async fn terminate(&self, slot: &mut Slot) -> RunnerResult {
        tracing::warn!(
            job = %slot.job.name,
            max_time = ?slot.job.max_time,
            "job exceeded its time limit"
        );
        let mut output = match slot.runner.read_output().await {
            Ok(output) => self.trim(&slot.job, output),
            Err(e) => {
                tracing::warn!(job = %slot.job.name, error = %e, "failed to read partial output");
                String::new()
            }
        };
        append_output(&mut output, &output_header(TERMINATED_BANNER));

        if let Err(e) = slot.runner.kill().await {
            tracing::warn!(job = %slot.job.name, error = %e, "failed to kill job");
        }
        if let Err(e) = slot.timer.stop(Timer::RUNNER_RUN) {
            tracing::debug!(job = %slot.job.name, error = %e, "runner timer not running");
        }

        RunnerResult {
            exit_code: TIMEOUT_EXIT_CODE,
            output,
            status: JobStatus::Timeout,
        }
    }

    fn trim(&self, job: &Job, output: String) -> String {
        if job.full_output {
            output
        } else {
            trim_output(output, self.config.max_buffer_size)
        }
    }
}
