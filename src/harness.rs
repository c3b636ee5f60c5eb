use std::collections::HashMap;
use std::io::Write;

use itertools::Itertools;

use crate::core::{
    domain::{Job, JobReport},
    output::output_header,
    tester::{Outcome, RunOptions, Tester},
    traits::harness::Harness,
};

const LINE_WIDTH: usize = 80;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Classifies finished jobs with their tester and prints one result line
/// per test, plus the captured output of failures.
pub struct ConsoleHarness<W: Write + Send> {
    testers: HashMap<String, Tester>,
    options: RunOptions,
    out: W,
    summary: Summary,
    dry_run: bool,
}

impl<W: Write + Send> ConsoleHarness<W> {
    pub fn new(options: RunOptions, out: W) -> Self {
        ConsoleHarness {
            testers: HashMap::new(),
            options,
            out,
            summary: Summary::default(),
            dry_run: false,
        }
    }

    /// Reports the command of every job instead of classifying its output.
    pub fn with_dry_run(self, dry_run: bool) -> Self {
        Self { dry_run, ..self }
    }

    pub fn add_tester(&mut self, tester: Tester) {
        self.testers.insert(tester.name().to_string(), tester);
    }

    pub fn report_skipped(&mut self, name: &str, reason: &str) {
        self.summary.skipped += 1;
        let line = result_line(name, &format!("[{reason}] SKIP"));
        self.emit(&line);
    }

    /// Prints the totals and returns them.
    pub fn finish(&mut self) -> Summary {
        let summary = self.summary.clone();
        let line = format!(
            "\n{} passed, {} failed, {} skipped",
            summary.passed, summary.failed, summary.skipped
        );
        self.emit(&line);
        summary
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{text}") {
            tracing::error!("Failed to write test results: {e}");
        }
    }
}

fn result_line(name: &str, result: &str) -> String {
    let dots = LINE_WIDTH.saturating_sub(name.len() + result.len() + 2).max(3);
    format!("{name} {} {result}", ".".repeat(dots))
}

impl<W: Write + Send> Harness for ConsoleHarness<W> {
    fn test_output_and_finish(&mut self, job: &Job, report: JobReport) {
        if self.dry_run {
            self.summary.passed += 1;
            let line = result_line(&job.name, "[DRY RUN] OK");
            self.emit(&format!("{}{line}", report.output));
            return;
        }
        let Some(tester) = self.testers.get(&job.name) else {
            tracing::error!("No tester registered for job {}", job.name);
            return;
        };
        let outcome = tester.process_report(&self.options, &report);
        let caveats = if tester.caveats().is_empty() {
            String::new()
        } else {
            format!("[{}] ", tester.caveats().iter().join(","))
        };
        tracing::debug!(
            "Classified {}: slot={} status={} outcome={outcome:?} elapsed={:?}",
            job.name,
            report.slot,
            report.status,
            report.elapsed
        );

        let elapsed = format!("{:.2}s", report.elapsed.as_secs_f64());
        match outcome {
            Outcome::Pass => {
                self.summary.passed += 1;
                let line = result_line(&job.name, &format!("{caveats}OK ({elapsed})"));
                self.emit(&line);
            }
            Outcome::Fail(reason) => {
                self.summary.failed += 1;
                let mut text = output_header(&format!("Output of {}", job.name));
                text.push_str(&report.output);
                text.push('\n');
                text.push_str(&result_line(
                    &job.name,
                    &format!("{caveats}FAILED ({reason}) ({elapsed})"),
                ));
                self.emit(&text);
            }
        }
    }

    fn job_stranded(&mut self, job: &Job) {
        self.report_skipped(&job.name, "PREREQ NEVER RAN");
    }
}
