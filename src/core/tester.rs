use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use itertools::Itertools;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::constants::{
    DEFAULT_ERRORS, DEFAULT_MAX_TIME_SECS, DEFAULT_MPI_COMMAND, MEMCHECK_CLEAN_SUMMARY,
    TIMEOUT_EXIT_CODE,
};
use crate::core::domain::{Job, JobReport, JobStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ValgrindMode {
    #[default]
    None,
    Normal,
    Heavy,
}

#[derive(Debug, thiserror::Error)]
pub enum TesterError {
    #[error("test {name}: one of `executable` or `command` must be given")]
    NothingToRun { name: String },
    #[error("test {name}: invalid {param} pattern: {source}")]
    InvalidPattern {
        name: String,
        param: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("test {name}: max_time must be a positive number of seconds, got {value}")]
    InvalidMaxTime { name: String, value: f64 },
    #[error("test {name}: {param} minimum {min} exceeds maximum {max}")]
    InvalidRange {
        name: String,
        param: &'static str,
        min: u32,
        max: u32,
    },
}

fn default_input_switch() -> String {
    "-i".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_max_parallel() -> u32 {
    1000
}

fn default_max_threads() -> u32 {
    16
}

fn default_errors() -> Vec<String> {
    DEFAULT_ERRORS.iter().map(|e| e.to_string()).collect()
}

fn default_valgrind() -> ValgrindMode {
    ValgrindMode::Normal
}

/// Declarative description of one test, as written in the manifest.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub executable: Option<String>,
    /// Runs `<working_dir>/<command> <cli_args>` instead of the executable.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default = "default_input_switch")]
    pub input_switch: String,
    #[serde(default)]
    pub cli_args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub prereq: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub max_time: Option<f64>,
    #[serde(default = "default_one")]
    pub min_parallel: u32,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    #[serde(default = "default_one")]
    pub min_threads: u32,
    #[serde(default = "default_max_threads")]
    pub max_threads: u32,
    #[serde(default)]
    pub expect_out: Option<String>,
    /// Must appear in the output; suppresses the error-string check.
    #[serde(default)]
    pub expect_err: Option<String>,
    /// Must not appear in the output.
    #[serde(default)]
    pub absent_out: Option<String>,
    /// Exact exit code required; replaces the crash rules when given.
    #[serde(default)]
    pub expect_exit_code: Option<i32>,
    #[serde(default)]
    pub match_literal: bool,
    #[serde(default = "default_errors")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub should_crash: bool,
    #[serde(default)]
    pub scale_refine: u32,
    #[serde(default = "default_valgrind")]
    pub valgrind: ValgrindMode,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default)]
    pub skip: Option<String>,
}

impl TestSpec {
    pub fn new(name: &str, executable: &str) -> Self {
        TestSpec {
            name: name.to_string(),
            executable: Some(executable.to_string()),
            command: None,
            input: None,
            input_switch: default_input_switch(),
            cli_args: Vec::new(),
            working_dir: None,
            prereq: None,
            max_time: None,
            min_parallel: 1,
            max_parallel: default_max_parallel(),
            min_threads: 1,
            max_threads: default_max_threads(),
            expect_out: None,
            expect_err: None,
            absent_out: None,
            expect_exit_code: None,
            match_literal: false,
            errors: default_errors(),
            should_crash: false,
            scale_refine: 0,
            valgrind: default_valgrind(),
            output_files: Vec::new(),
            skip: None,
        }
    }
}

/// Harness-wide knobs that shape every test's command line.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub parallel: Option<u32>,
    pub threads: u32,
    pub mpi_command: String,
    /// Always wrap with the MPI launcher, even for a single process.
    pub force_mpi: bool,
    pub valgrind_mode: ValgrindMode,
    pub valgrind_suppressions: Option<PathBuf>,
    pub scaling: bool,
    pub default_max_time: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            parallel: None,
            threads: 1,
            mpi_command: DEFAULT_MPI_COMMAND.to_string(),
            force_mpi: false,
            valgrind_mode: ValgrindMode::None,
            valgrind_suppressions: None,
            scaling: false,
            default_max_time: Duration::from_secs(DEFAULT_MAX_TIME_SECS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    ExpectedErrorMissing,
    OutputNotAbsent,
    OutFoundButCrash,
    NoExpectedOut,
    ExitCode { actual: i32, expected: i32 },
    MemoryError,
    ErrMsg,
    Timeout,
    Crash,
    NoCrash,
    FileTimeout,
    ExceededMemory,
    RunnerError,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailReason::ExitCode { actual, expected } => {
                return write!(f, "EXIT CODE {actual} != {expected}");
            }
            FailReason::ExpectedErrorMissing => "EXPECTED ERROR MISSING",
            FailReason::OutputNotAbsent => "OUTPUT NOT ABSENT",
            FailReason::OutFoundButCrash => "OUT FOUND BUT CRASH",
            FailReason::NoExpectedOut => "NO EXPECTED OUT",
            FailReason::MemoryError => "MEMORY ERROR",
            FailReason::ErrMsg => "ERRMSG",
            FailReason::Timeout => "TIMEOUT",
            FailReason::Crash => "CRASH",
            FailReason::NoCrash => "NO CRASH",
            FailReason::FileTimeout => "FILE TIMEOUT",
            FailReason::ExceededMemory => "EXCEEDED MEM",
            FailReason::RunnerError => "RUNNER ERROR",
        };
        f.write_str(reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail(FailReason),
}

#[derive(Debug)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn build(
        spec: &TestSpec,
        param: &'static str,
        text: Option<&String>,
    ) -> Result<Option<Self>, TesterError> {
        let Some(text) = text else {
            return Ok(None);
        };
        if spec.match_literal {
            return Ok(Some(Matcher::Literal(text.clone())));
        }
        RegexBuilder::new(text)
            .multi_line(true)
            .dot_matches_new_line(true)
            .build()
            .map(|regex| Some(Matcher::Pattern(regex)))
            .map_err(|source| TesterError::InvalidPattern {
                name: spec.name.clone(),
                param,
                source,
            })
    }

    fn is_match(&self, output: &str) -> bool {
        match self {
            Matcher::Literal(literal) => output.contains(literal.as_str()),
            Matcher::Pattern(regex) => regex.is_match(output),
        }
    }
}

/// Turns a [`TestSpec`] into a command line and judges the captured result.
#[derive(Debug)]
pub struct Tester {
    spec: TestSpec,
    working_dir: PathBuf,
    max_time: Option<Duration>,
    expect_out: Option<Matcher>,
    expect_err: Option<Matcher>,
    absent_out: Option<Matcher>,
    caveats: BTreeSet<String>,
}

impl Tester {
    pub fn new(spec: TestSpec) -> Result<Self, TesterError> {
        if spec.executable.is_none() && spec.command.is_none() {
            return Err(TesterError::NothingToRun { name: spec.name });
        }
        for (param, min, max) in [
            ("parallel", spec.min_parallel, spec.max_parallel),
            ("threads", spec.min_threads, spec.max_threads),
        ] {
            if min > max {
                return Err(TesterError::InvalidRange {
                    name: spec.name,
                    param,
                    min,
                    max,
                });
            }
        }

        let max_time = match spec.max_time {
            None => None,
            Some(value) => match Duration::try_from_secs_f64(value) {
                Ok(max_time) if !max_time.is_zero() => Some(max_time),
                _ => {
                    return Err(TesterError::InvalidMaxTime {
                        name: spec.name,
                        value,
                    });
                }
            },
        };

        let expect_out = Matcher::build(&spec, "expect_out", spec.expect_out.as_ref())?;
        let expect_err = Matcher::build(&spec, "expect_err", spec.expect_err.as_ref())?;
        let absent_out = Matcher::build(&spec, "absent_out", spec.absent_out.as_ref())?;

        let working_dir = spec
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Tester {
            spec,
            working_dir,
            max_time,
            expect_out,
            expect_err,
            absent_out,
            caveats: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.spec.skip.as_deref()
    }

    pub fn caveats(&self) -> &BTreeSet<String> {
        &self.caveats
    }

    pub fn add_caveat(&mut self, caveat: String) {
        self.caveats.insert(caveat);
    }

    /// Requested process count clamped to the test's range.
    pub fn procs(&mut self, options: &RunOptions) -> u32 {
        let requested = options.parallel.unwrap_or(1);
        let procs = requested
            .max(self.spec.min_parallel)
            .min(self.spec.max_parallel);
        if procs > requested {
            self.add_caveat(format!("MIN_CPUS={procs}"));
        } else if procs < requested {
            self.add_caveat(format!("MAX_CPUS={procs}"));
        }
        procs
    }

    /// Requested thread count clamped to the test's range.
    pub fn threads(&mut self, options: &RunOptions) -> u32 {
        let requested = options.threads;
        let threads = requested
            .max(self.spec.min_threads)
            .min(self.spec.max_threads);
        if threads > requested {
            self.add_caveat(format!("MIN_THREADS={threads}"));
        } else if threads < requested {
            self.add_caveat(format!("MAX_THREADS={threads}"));
        }
        threads
    }

    pub fn runs_memcheck(&self, options: &RunOptions) -> bool {
        match options.valgrind_mode {
            ValgrindMode::None => false,
            mode => {
                mode == self.spec.valgrind
                    || (mode == ValgrindMode::Heavy && self.spec.valgrind == ValgrindMode::Normal)
            }
        }
    }

    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn max_time(&self, options: &RunOptions) -> Duration {
        let base = self.max_time.unwrap_or(options.default_max_time);
        if !self.runs_memcheck(options) {
            return base;
        }
        let factor = match options.valgrind_mode {
            ValgrindMode::Normal => 2,
            ValgrindMode::Heavy => 6,
            ValgrindMode::None => 1,
        };
        base.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    pub fn command(&mut self, options: &RunOptions) -> String {
        if let Some(command) = &self.spec.command {
            let program = self.working_dir.join(command).display().to_string();
            return std::iter::once(program.as_str())
                .chain(self.spec.cli_args.iter().map(String::as_str))
                .join(" ");
        }

        let procs = self.procs(options);
        let threads = self.threads(options);

        let mut args: Vec<String> = vec![self.spec.executable.clone().unwrap_or_default()];
        if threads > 1 {
            args.push(format!("--n-threads={threads}"));
        }
        if let Some(input) = &self.spec.input {
            args.push(self.spec.input_switch.clone());
            args.push(input.clone());
        }
        args.extend(self.spec.cli_args.iter().cloned());
        if options.scaling && self.spec.scale_refine > 0 {
            args.push("-r".to_string());
            args.push(self.spec.scale_refine.to_string());
        }
        let command = args.join(" ");

        if options.force_mpi || procs > 1 || threads > 1 {
            format!("{} -n {procs} {command}", options.mpi_command)
        } else if self.runs_memcheck(options) {
            let suppressions = options
                .valgrind_suppressions
                .as_ref()
                .map(|path| format!("--suppressions={} ", path.display()))
                .unwrap_or_default();
            format!(
                "valgrind {suppressions}--leak-check=full --tool=memcheck --dsymutil=yes \
                 --track-origins=yes --demangle=yes -v {command}"
            )
        } else {
            command
        }
    }

    /// Builds the immutable job handed to the scheduler.
    pub fn job(&mut self, options: &RunOptions) -> Job {
        let command = self.command(options);
        let mut job = Job::new(&self.spec.name, &command)
            .in_dir(&self.working_dir)
            .with_max_time(self.max_time(options));
        if let Some(prereq) = &self.spec.prereq {
            job = job.with_prerequisite(prereq);
        }
        job.slots = self.procs(options) * self.threads(options);
        job.output_files = self
            .spec
            .output_files
            .iter()
            .map(|file| self.working_dir.join(file))
            .collect();
        job.full_output =
            self.expect_out.is_some() || self.expect_err.is_some() || self.absent_out.is_some();
        job
    }

    /// Classifies a completed process; the first matching rule wins.
    pub fn classify(&self, options: &RunOptions, exit_code: i32, output: &str) -> Outcome {
        if self.expect_err.as_ref().is_some_and(|m| !m.is_match(output)) {
            return Outcome::Fail(FailReason::ExpectedErrorMissing);
        }
        if self.absent_out.as_ref().is_some_and(|m| m.is_match(output)) {
            return Outcome::Fail(FailReason::OutputNotAbsent);
        }

        let expected_exit = self.spec.expect_exit_code.unwrap_or(0);
        if let Some(matcher) = &self.expect_out {
            return match (matcher.is_match(output), exit_code == expected_exit) {
                (true, true) => Outcome::Pass,
                (true, false) => Outcome::Fail(FailReason::OutFoundButCrash),
                (false, _) => Outcome::Fail(FailReason::NoExpectedOut),
            };
        }
        match self.spec.expect_exit_code {
            Some(expected) if exit_code != expected => {
                return Outcome::Fail(FailReason::ExitCode {
                    actual: exit_code,
                    expected,
                });
            }
            _ => {}
        }

        if self.runs_memcheck(options) && exit_code == 0 {
            return if output.contains(MEMCHECK_CLEAN_SUMMARY) {
                Outcome::Pass
            } else {
                Outcome::Fail(FailReason::MemoryError)
            };
        }

        let checks_errors = self.expect_err.is_none();
        if checks_errors && self.spec.errors.iter().any(|error| output.contains(error.as_str())) {
            Outcome::Fail(FailReason::ErrMsg)
        } else if exit_code == TIMEOUT_EXIT_CODE {
            Outcome::Fail(FailReason::Timeout)
        } else if self.spec.expect_exit_code.is_some() {
            Outcome::Pass
        } else if exit_code != 0 && !self.spec.should_crash {
            Outcome::Fail(FailReason::Crash)
        } else if exit_code > 0 && self.spec.should_crash {
            Outcome::Fail(FailReason::NoCrash)
        } else {
            Outcome::Pass
        }
    }

    /// Like [`Tester::classify`], but abnormal endings decided by the
    /// scheduler or runner take precedence over the output.
    pub fn process_report(&self, options: &RunOptions, report: &JobReport) -> Outcome {
        match &report.status {
            JobStatus::Finished => self.classify(options, report.exit_code, &report.output),
            JobStatus::Timeout => Outcome::Fail(FailReason::Timeout),
            JobStatus::FileTimeout { .. } => Outcome::Fail(FailReason::FileTimeout),
            JobStatus::ExceededMemory => Outcome::Fail(FailReason::ExceededMemory),
            JobStatus::Error { .. } => Outcome::Fail(FailReason::RunnerError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tester(spec: TestSpec) -> Tester {
        Tester::new(spec).unwrap()
    }

    fn parallel(n: u32) -> RunOptions {
        RunOptions {
            parallel: Some(n),
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_serial_command() {
        let mut spec = TestSpec::new("diffusion", "./app-opt");
        spec.input = Some("diffusion.i".to_string());
        spec.cli_args = vec!["Outputs/exodus=true".to_string()];

        let mut tester = tester(spec);
        assert_eq!(
            tester.command(&RunOptions::default()),
            "./app-opt -i diffusion.i Outputs/exodus=true"
        );
        assert!(tester.caveats().is_empty());
    }

    #[test]
    fn test_min_parallel_raises_procs() {
        let mut spec = TestSpec::new("parallel", "./app-opt");
        spec.min_parallel = 2;
        spec.max_parallel = 4;
        spec.input = Some("in.i".to_string());

        let mut tester = tester(spec);
        let options = parallel(1);
        assert_eq!(tester.procs(&options), 2);
        assert!(tester.caveats().contains("MIN_CPUS=2"));
        assert_eq!(tester.command(&options), "mpiexec -n 2 ./app-opt -i in.i");
    }

    #[test]
    fn test_max_caveats() {
        let mut spec = TestSpec::new("capped", "./app-opt");
        spec.max_parallel = 2;
        spec.max_threads = 2;

        let mut tester = tester(spec);
        let options = RunOptions {
            parallel: Some(8),
            threads: 4,
            ..RunOptions::default()
        };
        assert_eq!(
            tester.command(&options),
            "mpiexec -n 2 ./app-opt --n-threads=2"
        );
        let caveats: Vec<_> = tester.caveats().iter().cloned().collect();
        assert_eq!(caveats, vec!["MAX_CPUS=2", "MAX_THREADS=2"]);
    }

    #[test]
    fn test_min_threads_wraps_with_launcher() {
        let mut spec = TestSpec::new("threaded", "./app-opt");
        spec.min_threads = 3;

        let mut tester = tester(spec);
        let command = tester.command(&RunOptions::default());
        assert_eq!(command, "mpiexec -n 1 ./app-opt --n-threads=3");
        assert!(tester.caveats().contains("MIN_THREADS=3"));
    }

    #[test]
    fn test_scaling_appends_refinement() {
        let mut spec = TestSpec::new("scaled", "./app-opt");
        spec.input = Some("in.i".to_string());
        spec.scale_refine = 2;

        let mut tester = tester(spec);
        let options = RunOptions {
            scaling: true,
            ..RunOptions::default()
        };
        assert_eq!(tester.command(&options), "./app-opt -i in.i -r 2");
    }

    #[test]
    fn test_memcheck_wraps_serial_runs_only() {
        let mut spec = TestSpec::new("leaky", "./app-dbg");
        spec.input = Some("in.i".to_string());
        let options = RunOptions {
            valgrind_mode: ValgrindMode::Normal,
            ..RunOptions::default()
        };

        let mut serial = tester(spec.clone());
        let command = serial.command(&options);
        assert!(command.starts_with("valgrind "));
        assert!(command.ends_with("./app-dbg -i in.i"));

        let mut multi = tester(spec);
        let command = multi.command(&RunOptions {
            parallel: Some(2),
            ..options
        });
        assert!(command.starts_with("mpiexec -n 2 "));
    }

    #[test]
    fn test_memcheck_mode_matching() {
        let mut spec = TestSpec::new("heavy_only", "./app-dbg");
        spec.valgrind = ValgrindMode::Heavy;
        let tester = tester(spec);

        let normal = RunOptions {
            valgrind_mode: ValgrindMode::Normal,
            ..RunOptions::default()
        };
        let heavy = RunOptions {
            valgrind_mode: ValgrindMode::Heavy,
            ..RunOptions::default()
        };
        assert!(!tester.runs_memcheck(&normal));
        assert!(tester.runs_memcheck(&heavy));
        assert_eq!(
            tester.max_time(&heavy),
            RunOptions::default().default_max_time * 6
        );
    }

    #[test]
    fn test_arbitrary_command() {
        let mut spec = TestSpec::new("script", "unused");
        spec.executable = None;
        spec.command = Some("run.sh".to_string());
        spec.working_dir = Some(PathBuf::from("/tests/scripts"));
        spec.cli_args = vec!["--fast".to_string()];

        let mut tester = tester(spec);
        assert_eq!(
            tester.command(&parallel(4)),
            "/tests/scripts/run.sh --fast"
        );
    }

    #[test]
    fn test_job_carries_spec() {
        let mut spec = TestSpec::new("restart", "./app-opt");
        spec.prereq = Some("initial".to_string());
        spec.max_time = Some(1.5);
        spec.min_parallel = 2;
        spec.min_threads = 2;
        spec.working_dir = Some(PathBuf::from("/work"));
        spec.output_files = vec![PathBuf::from("out.e")];
        spec.expect_out = Some("Solve Converged".to_string());

        let mut tester = tester(spec);
        let job = tester.job(&RunOptions::default());
        assert_eq!(job.name, "restart");
        assert_eq!(job.prerequisite.as_deref(), Some("initial"));
        assert_eq!(job.max_time, Duration::from_millis(1500));
        assert_eq!(job.slots, 4);
        assert_eq!(job.output_files, vec![PathBuf::from("/work/out.e")]);
        assert!(job.full_output);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let mut spec = TestSpec::new("bad", "./app");
        spec.expect_out = Some("(unclosed".to_string());
        assert!(matches!(
            Tester::new(spec),
            Err(TesterError::InvalidPattern { .. })
        ));

        let mut spec = TestSpec::new("empty", "./app");
        spec.executable = None;
        assert!(matches!(
            Tester::new(spec),
            Err(TesterError::NothingToRun { .. })
        ));

        let mut spec = TestSpec::new("range", "./app");
        spec.min_parallel = 4;
        spec.max_parallel = 2;
        assert!(matches!(
            Tester::new(spec),
            Err(TesterError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_bad_max_time_rejected() {
        for value in [-1.0, 0.0, f64::NAN, f64::INFINITY, 1e30] {
            let mut spec = TestSpec::new("timing", "./app");
            spec.max_time = Some(value);
            assert!(
                matches!(Tester::new(spec), Err(TesterError::InvalidMaxTime { .. })),
                "accepted max_time {value}"
            );
        }
    }

    #[test]
    fn test_memcheck_max_time_saturates() {
        let tester = tester(TestSpec::new("forever", "./app"));
        let options = RunOptions {
            valgrind_mode: ValgrindMode::Heavy,
            default_max_time: Duration::from_secs(u64::MAX),
            ..RunOptions::default()
        };
        assert_eq!(tester.max_time(&options), Duration::MAX);
    }

    #[test]
    fn test_expected_error() {
        let mut spec = TestSpec::new("bad_input", "./app");
        spec.expect_err = Some(r"unknown parameter '\w+'".to_string());
        spec.expect_exit_code = Some(1);
        let tester = tester(spec);
        let options = RunOptions::default();

        let output = "*** ERROR ***\nunknown parameter 'foo'\n";
        assert_eq!(tester.classify(&options, 1, output), Outcome::Pass);
        assert_eq!(
            tester.classify(&options, 1, "*** ERROR ***\nsegfault\n"),
            Outcome::Fail(FailReason::ExpectedErrorMissing)
        );
        assert_eq!(
            tester.classify(&options, 0, output),
            Outcome::Fail(FailReason::ExitCode {
                actual: 0,
                expected: 1
            })
        );
        assert_eq!(
            FailReason::ExitCode {
                actual: 0,
                expected: 1
            }
            .to_string(),
            "EXIT CODE 0 != 1"
        );
    }

    #[test]
    fn test_absent_output() {
        let mut spec = TestSpec::new("quiet", "./app");
        spec.absent_out = Some("Deprecated".to_string());
        spec.match_literal = true;
        let tester = tester(spec);
        let options = RunOptions::default();

        assert_eq!(tester.classify(&options, 0, "all good\n"), Outcome::Pass);
        assert_eq!(
            tester.classify(&options, 0, "Deprecated option used\n"),
            Outcome::Fail(FailReason::OutputNotAbsent)
        );
        assert_eq!(
            FailReason::OutputNotAbsent.to_string(),
            "OUTPUT NOT ABSENT"
        );
    }

    #[test]
    fn test_expected_exit_code_replaces_crash_rule() {
        let mut spec = TestSpec::new("exits", "./app");
        spec.expect_exit_code = Some(3);
        let exits = tester(spec);
        let options = RunOptions::default();

        assert_eq!(exits.classify(&options, 3, "bye\n"), Outcome::Pass);
        assert_eq!(
            exits.classify(&options, 0, "bye\n"),
            Outcome::Fail(FailReason::ExitCode {
                actual: 0,
                expected: 3
            })
        );
        assert_eq!(
            exits.classify(&options, 3, "*** ERROR ***\n"),
            Outcome::Fail(FailReason::ErrMsg)
        );

        let mut spec = TestSpec::new("exits_with_out", "./app");
        spec.expect_exit_code = Some(3);
        spec.expect_out = Some("bye".to_string());
        let with_out = tester(spec);
        assert_eq!(with_out.classify(&options, 3, "bye\n"), Outcome::Pass);
        assert_eq!(
            with_out.classify(&options, 0, "bye\n"),
            Outcome::Fail(FailReason::OutFoundButCrash)
        );
    }

    #[test]
    fn test_invalid_expect_err_pattern_named() {
        let mut spec = TestSpec::new("bad_err", "./app");
        spec.expect_err = Some("[oops".to_string());
        match Tester::new(spec) {
            Err(TesterError::InvalidPattern { param, .. }) => assert_eq!(param, "expect_err"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_expected_output_with_crash() {
        let mut spec = TestSpec::new("expect", "./app");
        spec.expect_out = Some(r"Solve\s+Converged".to_string());
        let tester = tester(spec);
        let options = RunOptions::default();

        let output = "Time Step 1\nSolve   Converged!\n";
        assert_eq!(
            tester.classify(&options, 2, output),
            Outcome::Fail(FailReason::OutFoundButCrash)
        );
        assert_eq!(tester.classify(&options, 0, output), Outcome::Pass);
        assert_eq!(
            tester.classify(&options, 0, "Solve Did NOT Converge"),
            Outcome::Fail(FailReason::NoExpectedOut)
        );
    }

    #[test]
    fn test_literal_match() {
        let mut spec = TestSpec::new("literal", "./app");
        spec.expect_out = Some("value = [1.0]".to_string());
        spec.match_literal = true;
        let tester = tester(spec);

        assert_eq!(
            tester.classify(&RunOptions::default(), 0, "value = [1.0]\n"),
            Outcome::Pass
        );
    }

    #[test]
    fn test_memcheck_summary_required() {
        let tester = tester(TestSpec::new("mem", "./app"));
        let options = RunOptions {
            valgrind_mode: ValgrindMode::Normal,
            ..RunOptions::default()
        };

        assert_eq!(
            tester.classify(&options, 0, "==1== ERROR SUMMARY: 3 errors"),
            Outcome::Fail(FailReason::MemoryError)
        );
        assert_eq!(
            tester.classify(&options, 0, "==1== ERROR SUMMARY: 0 errors"),
            Outcome::Pass
        );
    }

    #[test]
    fn test_exit_code_rules() {
        let options = RunOptions::default();
        let normal = tester(TestSpec::new("normal", "./app"));
        assert_eq!(normal.classify(&options, 0, "done\n"), Outcome::Pass);
        assert_eq!(
            normal.classify(&options, 0, "*** ERROR ***\n"),
            Outcome::Fail(FailReason::ErrMsg)
        );
        assert_eq!(
            normal.classify(&options, TIMEOUT_EXIT_CODE, "partial"),
            Outcome::Fail(FailReason::Timeout)
        );
        assert_eq!(
            normal.classify(&options, 134, "aborted"),
            Outcome::Fail(FailReason::Crash)
        );

        let mut spec = TestSpec::new("crashy", "./app");
        spec.should_crash = true;
        let crashy = tester(spec);
        assert_eq!(
            crashy.classify(&options, 1, "exiting"),
            Outcome::Fail(FailReason::NoCrash)
        );
        assert_eq!(crashy.classify(&options, -6, "abort"), Outcome::Pass);
    }

    #[test]
    fn test_report_status_takes_precedence() {
        let tester = tester(TestSpec::new("status", "./app"));
        let report = JobReport {
            exit_code: 0,
            output: String::new(),
            status: JobStatus::ExceededMemory,
            elapsed: Duration::ZERO,
            slot: 0,
        };
        assert_eq!(
            tester.process_report(&RunOptions::default(), &report),
            Outcome::Fail(FailReason::ExceededMemory)
        );

        let report = JobReport {
            status: JobStatus::FileTimeout {
                missing: vec![PathBuf::from("out.e")],
            },
            ..report
        };
        assert_eq!(
            tester.process_report(&RunOptions::default(), &report),
            Outcome::Fail(FailReason::FileTimeout)
        );
    }
}
