//! Run reporting and output generation.
//!
//! Reporters observe a run through four events: the run starts, an entry
//! starts, an entry completes (after the telemetry sink has judged it) and
//! the run completes with its cleanup report. The dispatcher, the sink and
//! the orchestrator each hold an `Arc<dyn Reporter>`; the CLI wires a
//! [`MultiReporter`] holding a [`ConsoleReporter`] and, when enabled, a
//! [`JUnitReporter`].

pub mod junit;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::dispatcher::{TestResult, TestStatus};
use crate::image::ImageDescriptor;
use crate::orchestrator::RunResult;
use crate::plan::TestEntry;

pub use junit::JUnitReporter;

/// Receives events during a run. Every method defaults to a no-op.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once per image, before any entry runs.
    async fn on_run_start(&self, _image: &ImageDescriptor, _entries: usize) {}

    /// Called when an entry is handed to its adapter.
    async fn on_entry_start(&self, _entry: &TestEntry) {}

    /// Called with the final result of every entry, skipped ones included.
    async fn on_entry_complete(&self, _result: &TestResult) {}

    /// Called after cleanup for the image has finished.
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that does nothing.
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Fans events out to several reporters in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, image: &ImageDescriptor, entries: usize) {
        for reporter in &self.reporters {
            reporter.on_run_start(image, entries).await;
        }
    }

    async fn on_entry_start(&self, entry: &TestEntry) {
        for reporter in &self.reporters {
            reporter.on_entry_start(entry).await;
        }
    }

    async fn on_entry_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_entry_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Progress bar and summary on the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

fn status_label(status: TestStatus) -> console::StyledObject<&'static str> {
    match status {
        TestStatus::Pass => console::style("PASS ").green(),
        TestStatus::Fail => console::style("FAIL ").red(),
        TestStatus::Skip => console::style("SKIP ").yellow(),
        TestStatus::InfraError => console::style("INFRA").red().bold(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, image: &ImageDescriptor, entries: usize) {
        println!("Testing {} ({} entries)", image, entries);

        let pb = indicatif::ProgressBar::new(entries as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_entry_start(&self, entry: &TestEntry) {
        if self.verbose {
            self.with_progress(|pb| pb.println(format!("Running: {}", entry.id)));
        }
        self.with_progress(|pb| pb.set_message(entry.id.clone()));
    }

    async fn on_entry_complete(&self, result: &TestResult) {
        self.with_progress(|pb| {
            pb.inc(1);
            if self.verbose || !result.is_pass() {
                pb.println(format!("{} {}", status_label(result.status), result.entry_id));
            }
        });
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }
        print_summary(result);
    }
}

/// Prints the counts of one run to stdout and every non-pass entry and
/// cleanup error to stderr.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Results for {}:", result.image);
    println!("  Total:       {}", result.results.len());
    println!("  Passed:      {}", console::style(result.passed()).green());
    println!("  Failed:      {}", console::style(result.failed()).red());
    println!(
        "  Infra error: {}",
        console::style(result.infra_errors()).red().bold()
    );
    println!("  Skipped:     {}", console::style(result.skipped()).yellow());
    println!("  Cleanup:     {}", result.cleanup);
    println!("  Duration:    {:?}", result.duration);

    let not_passed: Vec<&TestResult> = result
        .results
        .iter()
        .filter(|r| matches!(r.status, TestStatus::Fail | TestStatus::InfraError))
        .collect();

    if not_passed.is_empty() && result.cleanup.is_clean() {
        println!();
        println!("{}", console::style("All entries passed!").green().bold());
        return;
    }

    if !not_passed.is_empty() {
        eprintln!();
        eprintln!(
            "{}",
            console::style(format!("Entries not passed ({}):", not_passed.len()))
                .red()
                .bold()
        );
        for r in not_passed {
            eprintln!("  - {}", r.summary_line());
        }
    }
    result.cleanup.print_failures();
}
