//! Test dispatcher.
//!
//! The dispatcher turns a [`TestPlan`] into [`TestResult`]s for one image
//! and one platform family. The runnable subset is computed up front; the
//! entries are then grouped into stages and driven through their adapters.
//!
//! ```text
//!   TestPlan ──select()──► Vec<Selected> ──stages()──► Vec<Stage>
//!                              │                           │
//!                      Skip(reason) results        Serial(entry)  ──► run_entry
//!                              │                   Group(entries) ──► run_entry × N
//!                              ▼                           │        (buffer_unordered)
//!                       mpsc::Sender<TestResult> ◄─────────┘
//!                              │
//!                              ▼
//!                        TelemetrySink (single consumer)
//! ```
//!
//! # Ordering
//!
//! Entries without a `parallel_group` run one at a time in buildspec order.
//! All entries of a group form one stage, placed where the first of them
//! appears, and run with at most `max_parallel` in flight. Inside an entry,
//! commands run in listed order and the first non-zero exit stops the rest.
//!
//! # Cancellation
//!
//! The token is checked before every entry starts. A running command is
//! never interrupted; entries that had not started are reported as skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, AdapterFactory, FailureKind, PlatformAdapter};
use crate::image::ImageDescriptor;
use crate::plan::{DataSource, GlobalContext, PlatformFamily, TestEntry, TestPlan, Workload};
use crate::remote::ExecResult;
use crate::report::{NullReporter, Reporter};
use crate::telemetry::Metric;

/// Final status of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    InfraError,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
            TestStatus::InfraError => "infra-error",
        }
    }

    /// Maps a failure kind onto the status it produces.
    pub fn for_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Cancelled => TestStatus::Skip,
            k if k.is_infrastructure() => TestStatus::InfraError,
            _ => TestStatus::Fail,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub command: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Outcome of one entry against one image.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub entry_id: String,
    pub image_name: String,
    pub image_uri: String,
    pub stage: String,
    pub platform: String,
    pub workload: Workload,
    pub data_source: Option<DataSource>,
    pub instance_type: Option<String>,
    pub status: TestStatus,
    pub failure: Option<FailureKind>,
    /// One line describing why the entry did not pass.
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub commands: Vec<CommandRecord>,
    /// Combined output of setup notes and every command.
    #[serde(skip)]
    pub output: String,
    /// Local log file.
    pub log_file: Option<PathBuf>,
    /// Uploaded log, filled in by the telemetry sink.
    pub logs_ref: Option<String>,
    pub metrics: Vec<Metric>,
}

impl TestResult {
    fn new(entry: &TestEntry, image: &ImageDescriptor) -> Self {
        let now = Utc::now();
        Self {
            entry_id: entry.id.clone(),
            image_name: entry.image_name.clone(),
            image_uri: image.uri.clone(),
            stage: entry.stage(),
            platform: entry.platform.tag.clone(),
            workload: entry.workload(image),
            data_source: entry.data_source,
            instance_type: entry.params.str("instance_type").map(str::to_string),
            status: TestStatus::Pass,
            failure: None,
            message: None,
            started_at: now,
            ended_at: now,
            commands: Vec::new(),
            output: String::new(),
            log_file: None,
            logs_ref: None,
            metrics: Vec::new(),
        }
    }

    /// A passing result not tied to a plan entry.
    #[cfg(test)]
    pub(crate) fn for_tests(entry_id: &str, platform: &str, image_uri: &str) -> Self {
        let now = Utc::now();
        Self {
            entry_id: entry_id.to_string(),
            image_name: entry_id.split('/').next().unwrap_or(entry_id).to_string(),
            image_uri: image_uri.to_string(),
            stage: entry_id.rsplit('/').next().unwrap_or(entry_id).to_string(),
            platform: platform.to_string(),
            workload: Workload::Training,
            data_source: None,
            instance_type: None,
            status: TestStatus::Pass,
            failure: None,
            message: None,
            started_at: now,
            ended_at: now,
            commands: Vec::new(),
            output: String::new(),
            log_file: None,
            logs_ref: None,
            metrics: Vec::new(),
        }
    }

    /// A result for an entry that never started.
    pub fn skipped(
        entry: &TestEntry,
        image: &ImageDescriptor,
        kind: Option<FailureKind>,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(entry, image);
        result.status = TestStatus::Skip;
        result.failure = kind;
        result.message = Some(reason.into());
        result
    }

    /// Records a failure. The first failure wins.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        if self.failure.is_some() {
            return;
        }
        self.status = TestStatus::for_failure(kind);
        self.failure = Some(kind);
        self.message = Some(message.into());
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn is_pass(&self) -> bool {
        self.status == TestStatus::Pass
    }

    /// `<platform> <image tag>: <kind> (<log>)`, for non-pass summaries.
    pub fn summary_line(&self) -> String {
        let tag = self.image_uri.rsplit(':').next().unwrap_or(&self.image_uri);
        let mut line = format!("{} {} [{}]", self.platform, tag, self.status);
        if let Some(kind) = self.failure {
            line.push_str(&format!(" {}", kind));
        }
        if let Some(message) = &self.message {
            line.push_str(&format!(": {}", message));
        }
        match (&self.logs_ref, &self.log_file) {
            (Some(uploaded), _) => line.push_str(&format!(" (log: {})", uploaded)),
            (None, Some(local)) => line.push_str(&format!(" (log: {})", local.display())),
            (None, None) => {}
        }
        line
    }
}

/// Whether an entry runs, with the reason when it does not.
#[derive(Debug)]
pub enum Selected<'a> {
    Run(&'a TestEntry),
    Skip(&'a TestEntry, String),
}

/// A unit of scheduling.
#[derive(Debug)]
pub enum Stage<'a> {
    Serial(&'a TestEntry),
    Group(String, Vec<&'a TestEntry>),
}

impl Stage<'_> {
    pub fn entries(&self) -> Vec<&TestEntry> {
        match self {
            Stage::Serial(entry) => vec![*entry],
            Stage::Group(_, entries) => entries.clone(),
        }
    }
}

/// Picks the entries of `image_name` that belong to `family` and decides
/// which of them run against `image`.
///
/// Entries of other families are not part of this run and are dropped.
pub fn select<'a>(
    plan: &'a TestPlan,
    image_name: &str,
    image: &ImageDescriptor,
    family: PlatformFamily,
) -> Vec<Selected<'a>> {
    plan.entries_for(image_name)
        .into_iter()
        .filter(|entry| entry.platform.family == family)
        .map(|entry| {
            if let Some(processor) = entry.platform.processor
                && processor != image.processor()
            {
                return Selected::Skip(
                    entry,
                    format!(
                        "platform {} targets {} images, image is {}",
                        entry.platform,
                        processor,
                        image.processor()
                    ),
                );
            }
            match entry.selectors.evaluate(image) {
                Ok(()) => Selected::Run(entry),
                Err(reason) => Selected::Skip(entry, reason),
            }
        })
        .collect()
}

/// Groups runnable entries into stages, keeping buildspec order.
pub fn stages<'a>(entries: &[&'a TestEntry]) -> Vec<Stage<'a>> {
    let mut stages: Vec<Stage<'a>> = Vec::new();
    let mut group_slot: HashMap<&str, usize> = HashMap::new();

    for &entry in entries {
        match entry.parallel_group.as_deref() {
            None => stages.push(Stage::Serial(entry)),
            Some(label) => match group_slot.get(label) {
                Some(&slot) => {
                    if let Stage::Group(_, members) = &mut stages[slot] {
                        members.push(entry);
                    }
                }
                None => {
                    group_slot.insert(label, stages.len());
                    stages.push(Stage::Group(label.to_string(), vec![entry]));
                }
            },
        }
    }
    stages
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub max_parallel: usize,
    /// Receives one `<image-name>-<stage>` file per entry.
    pub log_dir: PathBuf,
}

/// Counts of what a dispatch produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub ran: usize,
    pub skipped: usize,
}

/// Drives selected entries through their adapters.
pub struct Dispatcher {
    factory: AdapterFactory,
    options: DispatchOptions,
    cancel: CancellationToken,
    reporter: Arc<dyn Reporter>,
}

impl Dispatcher {
    pub fn new(factory: AdapterFactory, options: DispatchOptions, cancel: CancellationToken) -> Self {
        Self {
            factory,
            options,
            cancel,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs every entry of `image_name` for `family` against `image` and
    /// sends each result to `results`.
    pub async fn dispatch(
        &self,
        plan: &TestPlan,
        image_name: &str,
        image: &ImageDescriptor,
        family: PlatformFamily,
        results: mpsc::Sender<TestResult>,
    ) -> DispatchStats {
        let selection = select(plan, image_name, image, family);
        let mut stats = DispatchStats::default();
        let mut runnable = Vec::new();

        for selected in selection {
            match selected {
                Selected::Run(entry) => runnable.push(entry),
                Selected::Skip(entry, reason) => {
                    info!(entry = %entry.id, reason = %reason, "Skipping entry");
                    stats.skipped += 1;
                    send(&results, TestResult::skipped(entry, image, None, reason)).await;
                }
            }
        }

        info!(
            image = %image,
            family = %family.as_str(),
            runnable = runnable.len(),
            skipped = stats.skipped,
            "Dispatching entries"
        );

        for stage in stages(&runnable) {
            if self.cancel.is_cancelled() {
                for entry in stage.entries() {
                    stats.skipped += 1;
                    send(&results, self.cancelled(entry, image)).await;
                }
                continue;
            }

            match stage {
                Stage::Serial(entry) => {
                    stats.ran += 1;
                    let result = self.run_entry(entry, image, &plan.globals).await;
                    send(&results, result).await;
                }
                Stage::Group(label, entries) => {
                    debug!(group = %label, size = entries.len(), "Running parallel group");
                    let outcomes: Vec<(bool, TestResult)> =
                        futures::stream::iter(entries.into_iter().map(|entry| async move {
                            if self.cancel.is_cancelled() {
                                (false, self.cancelled(entry, image))
                            } else {
                                (true, self.run_entry(entry, image, &plan.globals).await)
                            }
                        }))
                        .buffer_unordered(self.options.max_parallel.max(1))
                        .collect()
                        .await;

                    for (ran, result) in outcomes {
                        if ran {
                            stats.ran += 1;
                        } else {
                            stats.skipped += 1;
                        }
                        send(&results, result).await;
                    }
                }
            }
        }

        stats
    }

    fn cancelled(&self, entry: &TestEntry, image: &ImageDescriptor) -> TestResult {
        info!(entry = %entry.id, "Cancelled before start");
        TestResult::skipped(
            entry,
            image,
            Some(FailureKind::Cancelled),
            "run cancelled before the entry started",
        )
    }

    /// `setup → execute_command* → teardown` for one entry.
    pub async fn run_entry(
        &self,
        entry: &TestEntry,
        image: &ImageDescriptor,
        globals: &GlobalContext,
    ) -> TestResult {
        self.reporter.on_entry_start(entry).await;
        info!(entry = %entry.id, platform = %entry.platform, "Starting entry");

        let mut result = TestResult::new(entry, image);
        let mut log = EntryLog::default();
        let mut adapter = self.factory.create(entry, image);
        let params = entry.setup_params(globals, &image.uri);

        match adapter.setup(&params).await {
            Ok(set) => {
                log.note(&format!(
                    "setup complete: {} resources, hosts [{}]",
                    set.resources.len(),
                    set.hosts.join(", ")
                ));
                if let Some(endpoint) = &set.endpoint {
                    log.note(&format!("endpoint {}", endpoint));
                }
                self.run_commands(adapter.as_mut(), entry, &mut result, &mut log)
                    .await;
            }
            Err(e) => {
                warn!(entry = %entry.id, error = %e, "Setup failed");
                log.note(&format!("setup failed: {}", e));
                result.fail(e.kind(), format!("setup failed: {}", e));
            }
        }

        if let Err(e) = adapter.teardown().await {
            warn!(entry = %entry.id, error = %e, "Teardown failed");
            log.note(&format!("teardown failed: {}", e));
        }

        result.ended_at = Utc::now();
        result.output = log.text;
        result.log_file = write_log(&self.options.log_dir, &result).await;

        info!(
            entry = %entry.id,
            status = %result.status,
            duration = ?result.duration(),
            "Finished entry"
        );
        result
    }

    async fn run_commands(
        &self,
        adapter: &mut dyn PlatformAdapter,
        entry: &TestEntry,
        result: &mut TestResult,
        log: &mut EntryLog,
    ) {
        for command in &entry.run {
            log.note(&format!("$ {}", command));
            match adapter.execute_command(command).await {
                Ok(exec) => {
                    log.output(&entry.id, &exec);
                    result.commands.push(CommandRecord {
                        command: command.clone(),
                        exit_code: exec.exit_code,
                        duration: exec.duration,
                    });
                    if !exec.success() {
                        result.fail(
                            FailureKind::RemoteCommandFailed,
                            format!("`{}` exited with {}", command, exec.exit_code),
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!(entry = %entry.id, command = %command, error = %e, "Command failed");
                    log.note(&format!("error: {}", e));
                    record_error(result, command, &e);
                    break;
                }
            }
        }
    }
}

fn record_error(result: &mut TestResult, command: &str, error: &AdapterError) {
    result.commands.push(CommandRecord {
        command: command.to_string(),
        exit_code: -1,
        duration: Duration::ZERO,
    });
    result.fail(error.kind(), format!("`{}`: {}", command, error));
}

async fn send(results: &mpsc::Sender<TestResult>, result: TestResult) {
    if results.send(result).await.is_err() {
        warn!("Result channel closed; dropping result");
    }
}

/// Accumulates an entry's combined output.
#[derive(Default)]
struct EntryLog {
    text: String,
}

impl EntryLog {
    fn note(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn output(&mut self, entry: &str, exec: &ExecResult) {
        for line in exec.stdout.lines().chain(exec.stderr.lines()) {
            debug!(entry = %entry, "{}", line);
        }
        self.text.push_str(&exec.combined_output());
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.note(&format!("exit {} after {:?}", exec.exit_code, exec.duration));
    }
}

async fn write_log(dir: &Path, result: &TestResult) -> Option<PathBuf> {
    let path = dir.join(format!("{}-{}", result.image_name, result.stage));
    let write = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, &result.output).await
    };
    match write.await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to write entry log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::Harness;
    use crate::buildspec;
    use crate::cloud::CloudError;

    const IMAGE: &str =
        "123456789012.dkr.ecr.us-west-2.amazonaws.com/pytorch-training:2.6.0-cpu-py312-ubuntu22.04-ec2";

    fn plan(body: &str) -> TestPlan {
        let yaml = format!(
            "framework: pytorch\nregion: us-west-2\naccount_id: \"123456789012\"\narch_type: x86\nimages:\n  training:\n    repository: pytorch-training\n    device_type: cpu\n    tests:\n{}",
            body
        );
        buildspec::parse(&yaml, |_| None, Path::new("/")).unwrap()
    }

    fn image() -> ImageDescriptor {
        ImageDescriptor::parse(IMAGE).unwrap()
    }

    fn dispatcher(h: &Harness) -> Dispatcher {
        Dispatcher::new(
            AdapterFactory::new(h.context()),
            DispatchOptions {
                max_parallel: 4,
                log_dir: h.dir.path().join("logs"),
            },
            h.cancel.clone(),
        )
    }

    async fn run(h: &Harness, plan: &TestPlan) -> (DispatchStats, Vec<TestResult>) {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = dispatcher(h)
            .dispatch(plan, "training", &image(), PlatformFamily::Vm, tx)
            .await;
        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        (stats, results)
    }

    const VM_TEST: &str = "      - platform: vm-cpu\n        params: {instance_type: c5.9xlarge, node_count: 1}\n        run: [\"python -c 'import torch'\", \"python train.py\", \"python eval.py\"]\n";

    #[test]
    fn test_stages_keep_order_and_group() {
        let plan = plan(concat!(
            "      - platform: vm-cpu\n        params: {instance_type: a}\n        run: [one]\n",
            "      - platform: vm-cpu\n        params: {instance_type: b, parallel_group: g}\n        run: [two]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c}\n        run: [three]\n",
            "      - platform: vm-cpu\n        params: {instance_type: d, parallel_group: g}\n        run: [four]\n",
        ));
        let entries: Vec<&TestEntry> = plan.entries.iter().collect();
        let stages = stages(&entries);

        assert_eq!(stages.len(), 3);
        assert!(matches!(stages[0], Stage::Serial(e) if e.index == 0));
        match &stages[1] {
            Stage::Group(label, members) => {
                assert_eq!(label, "g");
                assert_eq!(members.iter().map(|e| e.index).collect::<Vec<_>>(), [1, 3]);
            }
            other => panic!("expected group, got {:?}", other),
        }
        assert!(matches!(stages[2], Stage::Serial(e) if e.index == 2));
    }

    #[test]
    fn test_select_filters_family_and_processor() {
        let plan = plan(concat!(
            "      - platform: vm-gpu\n        params: {instance_type: p3.2xlarge}\n        run: [one]\n",
            "      - platform: kube-cpu\n        params: {cluster: c, namespace: n}\n        run: [two]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge}\n        run: [three]\n",
        ));
        let selected = select(&plan, "training", &image(), PlatformFamily::Vm);

        assert_eq!(selected.len(), 2);
        assert!(matches!(&selected[0], Selected::Skip(e, reason) if e.index == 0 && reason.contains("gpu")));
        assert!(matches!(&selected[1], Selected::Run(e) if e.index == 2));
    }

    #[tokio::test]
    async fn test_short_circuit_on_first_failure() {
        let h = Harness::new();
        h.remote.on("python train.py", 3, "loss exploded");
        let plan = plan(VM_TEST);

        let (stats, results) = run(&h, &plan).await;

        assert_eq!(stats, DispatchStats { ran: 1, skipped: 0 });
        let result = &results[0];
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.failure, Some(FailureKind::RemoteCommandFailed));
        assert_eq!(result.commands.len(), 2);
        assert!(
            !h.remote
                .commands()
                .iter()
                .any(|(_, line)| line.contains("python eval.py"))
        );

        let log = std::fs::read_to_string(result.log_file.as_ref().unwrap()).unwrap();
        assert!(log.contains("loss exploded"));
        assert!(result.log_file.as_ref().unwrap().ends_with("training-0-vm-cpu"));
    }

    #[tokio::test]
    async fn test_capacity_failure_is_infra_error_and_run_continues() {
        let h = Harness::new();
        for _ in 0..3 {
            h.cloud.fail_next(
                "run_instances",
                CloudError::from_code("InsufficientInstanceCapacity", "none left"),
            );
        }
        let plan = plan(concat!(
            "      - platform: vm-cpu\n        params: {instance_type: c5.18xlarge}\n        run: [one]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge}\n        run: [two]\n",
        ));

        let (stats, results) = run(&h, &plan).await;

        assert_eq!(stats.ran, 2);
        assert_eq!(results[0].status, TestStatus::InfraError);
        assert_eq!(results[0].failure, Some(FailureKind::CapacityUnavailable));
        assert!(results[0].commands.is_empty());
        assert!(
            !h.ledger
                .snapshot()
                .iter()
                .any(|handle| handle.owner == results[0].entry_id
                    && matches!(handle.resource, crate::ledger::Resource::Instance { .. }))
        );
        assert_eq!(results[1].status, TestStatus::Pass);
    }

    /// Fires the token as soon as the first entry starts.
    struct CancelOnStart(CancellationToken);

    #[async_trait::async_trait]
    impl Reporter for CancelOnStart {
        async fn on_entry_start(&self, _entry: &TestEntry) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining_entries() {
        let h = Harness::new();
        let plan = plan(concat!(
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge}\n        run: [one]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge}\n        run: [two]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge}\n        run: [three]\n",
        ));

        // Separate from the provider's token so the running entry finishes.
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            AdapterFactory::new(h.context()),
            DispatchOptions {
                max_parallel: 1,
                log_dir: h.dir.path().join("logs"),
            },
            cancel.clone(),
        )
        .with_reporter(Arc::new(CancelOnStart(cancel)));

        let (tx, mut rx) = mpsc::channel(16);
        let stats = dispatcher
            .dispatch(&plan, "training", &image(), PlatformFamily::Vm, tx)
            .await;
        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }

        assert_eq!(stats, DispatchStats { ran: 1, skipped: 2 });
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[0].commands.len(), 1);
        assert!(results[1..].iter().all(|r| r.status == TestStatus::Skip
            && r.failure == Some(FailureKind::Cancelled)));
        assert_eq!(h.cloud.count_calls("run_instances"), 1);
    }

    #[tokio::test]
    async fn test_parallel_group_runs_every_member() {
        let h = Harness::new();
        let plan = plan(concat!(
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge, parallel_group: smoke}\n        run: [one]\n",
            "      - platform: vm-cpu\n        params: {instance_type: c5.4xlarge, parallel_group: smoke}\n        run: [two]\n",
        ));

        let (stats, results) = run(&h, &plan).await;

        assert_eq!(stats.ran, 2);
        assert!(results.iter().all(TestResult::is_pass));
        assert_eq!(h.cloud.live_instances().len(), 2);
    }

    #[test]
    fn test_status_for_failure() {
        assert_eq!(TestStatus::for_failure(FailureKind::ProvisionTimeout), TestStatus::InfraError);
        assert_eq!(TestStatus::for_failure(FailureKind::ThresholdBreach), TestStatus::Fail);
        assert_eq!(TestStatus::for_failure(FailureKind::Cancelled), TestStatus::Skip);
        assert_eq!(
            serde_json::to_value(TestStatus::InfraError).unwrap(),
            serde_json::json!("infra-error")
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let plan = plan(VM_TEST);
        let mut result = TestResult::new(&plan.entries[0], &image());
        result.fail(FailureKind::RemoteCommandFailed, "exit 1");
        result.fail(FailureKind::ThresholdBreach, "slow");
        assert_eq!(result.failure, Some(FailureKind::RemoteCommandFailed));
        assert_eq!(result.status, TestStatus::Fail);
    }
}
