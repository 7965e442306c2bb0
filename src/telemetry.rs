//! Result and telemetry sink.
//!
//! The sink is the single consumer of the dispatcher's result channel. For
//! every result it:
//!
//! 1. uploads the raw log under
//!    `<base>/<framework>/<version>/<platform>/<workload>/<processor>/<python>/<timestamp>.log`,
//! 2. extracts benchmark numbers when the entry declares a `data_source`,
//! 3. checks each number against the [`ThresholdTable`] and fails the
//!    result on a breach,
//! 4. emits one [`Metric`] per number with the full dimension set, plus the
//!    run-level `Test Duration` and `Test Errors` metrics outside executor
//!    mode,
//! 5. hands the final result to the reporter.
//!
//! Uploads and emission are best effort: a failure is logged and never
//! changes a test outcome.

pub mod extract;
pub mod threshold;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::FailureKind;
use crate::cloud::{CloudError, CloudResult, MetricsBackend, ObjectStore};
use crate::config::TelemetryConfig;
use crate::dispatcher::{TestResult, TestStatus};
use crate::environment::BuildContext;
use crate::image::ImageDescriptor;
use crate::report::{NullReporter, Reporter};

pub use extract::{Direction, Measurement};
pub use threshold::{Threshold, ThresholdTable, Verdict};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to upload log: {0}")]
    Upload(#[source] CloudError),

    #[error("Failed to emit metrics: {0}")]
    Emit(#[source] CloudError),

    #[error("Invalid threshold: {0}")]
    Threshold(String),
}

/// One data point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            dimensions: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    /// The wire payload: `{Namespace, MetricName, Value, Unit, Timestamp, Dimensions}`.
    pub fn payload(&self, namespace: &str) -> MetricPayload {
        MetricPayload {
            namespace: namespace.to_string(),
            metric_name: self.name.clone(),
            value: self.value,
            unit: self.unit.clone(),
            timestamp: self.timestamp,
            dimensions: self
                .dimensions
                .iter()
                .map(|(name, value)| DimensionPayload {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricPayload {
    pub namespace: String,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub dimensions: Vec<DimensionPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DimensionPayload {
    pub name: String,
    pub value: String,
}

/// Appends metric payloads to a JSON-lines file.
pub struct JsonLinesMetrics {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesMetrics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn append(&self, namespace: &str, metrics: &[Metric]) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for metric in metrics {
            let mut line = serde_json::to_string(&metric.payload(namespace))
                .map_err(std::io::Error::other)?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
        }
        file.flush().await
    }
}

#[async_trait]
impl MetricsBackend for JsonLinesMetrics {
    async fn put_metrics(&self, namespace: &str, metrics: &[Metric]) -> CloudResult<()> {
        self.append(namespace, metrics)
            .await
            .map_err(|e| CloudError::Api {
                code: "MetricsFileWrite".to_string(),
                message: e.to_string(),
            })
    }
}

/// Object-store key for a result's raw log.
pub fn object_key(base: &str, image: &ImageDescriptor, result: &TestResult) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}/{}.log",
        base.trim_end_matches('/'),
        image.framework,
        image.framework_version(),
        result.platform,
        result.workload,
        image.processor(),
        image.python_version(),
        result.started_at.format("%Y-%m-%d-%H-%M-%S"),
    )
}

/// Run-wide values carried as metric dimensions.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub image: ImageDescriptor,
    pub build_context: BuildContext,
    pub commit: Option<String>,
    /// Suppresses run-level metrics.
    pub executor_mode: bool,
}

/// Consumes results: upload, extract, compare, emit, report.
pub struct TelemetrySink {
    config: TelemetryConfig,
    store: Option<Arc<dyn ObjectStore>>,
    metrics: Arc<dyn MetricsBackend>,
    thresholds: ThresholdTable,
    run: RunContext,
    reporter: Arc<dyn Reporter>,
}

impl TelemetrySink {
    /// `store` is `None` when no bucket is configured; logs then stay local.
    pub fn new(
        config: TelemetryConfig,
        store: Option<Arc<dyn ObjectStore>>,
        metrics: Arc<dyn MetricsBackend>,
        thresholds: ThresholdTable,
        run: RunContext,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
            thresholds,
            run,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Drains `results` until every sender is gone.
    pub async fn consume(&self, mut results: mpsc::Receiver<TestResult>) -> Vec<TestResult> {
        let mut done = Vec::new();
        while let Some(result) = results.recv().await {
            let result = self.process(result).await;
            self.reporter.on_entry_complete(&result).await;
            done.push(result);
        }
        debug!(count = done.len(), "Result channel drained");
        done
    }

    /// Handles one result and returns it with logs, metrics and the
    /// threshold verdict applied.
    pub async fn process(&self, mut result: TestResult) -> TestResult {
        if result.status == TestStatus::Skip {
            return result;
        }

        if let Some(store) = &self.store {
            match self.upload(store.as_ref(), &result).await {
                Ok(reference) => result.logs_ref = Some(reference),
                Err(e) => warn!(entry = %result.entry_id, error = %e, "Log upload failed"),
            }
        }

        let mut metrics = Vec::new();
        if let Some(source) = result.data_source
            && result.status == TestStatus::Pass
        {
            let measurements = extract::extract(source, &result.output, self.config.tail_lines);
            if measurements.is_empty() {
                warn!(entry = %result.entry_id, data_source = ?source, "No benchmark numbers found");
            }
            for measurement in measurements {
                self.judge(&mut result, &measurement);
                metrics.push(self.measurement_metric(&result, &measurement));
            }
        }

        if !self.run.executor_mode {
            metrics.extend(run_metrics(&result));
        }

        if !metrics.is_empty()
            && let Err(e) = self.emit(&metrics).await
        {
            warn!(entry = %result.entry_id, error = %e, "Metric emission failed");
        }
        result.metrics = metrics;

        if !result.is_pass() {
            info!(entry = %result.entry_id, "{}", result.summary_line());
        }
        result
    }

    fn judge(&self, result: &mut TestResult, measurement: &Measurement) {
        let Some(verdict) = self
            .thresholds
            .check(&self.run.image, result.workload, measurement)
        else {
            debug!(entry = %result.entry_id, metric = %measurement.name, "No threshold row");
            return;
        };

        info!(
            entry = %result.entry_id,
            metric = %measurement.name,
            value = measurement.value,
            threshold = verdict.threshold,
            passed = verdict.passed,
            "Checked benchmark"
        );
        if !verdict.passed {
            let relation = match verdict.direction {
                Direction::Min => "below",
                Direction::Max => "above",
            };
            result.fail(
                FailureKind::ThresholdBreach,
                format!(
                    "{} {} {} is {} threshold {}",
                    measurement.name, measurement.value, measurement.unit, relation, verdict.threshold
                ),
            );
        }
    }

    fn measurement_metric(&self, result: &TestResult, measurement: &Measurement) -> Metric {
        let image = &self.run.image;
        let mut metric = Metric::new(&measurement.name, measurement.value, &measurement.unit)
            .dimension("Framework", image.framework.clone())
            .dimension("FrameworkVersion", image.framework_version())
            .dimension("Platform", result.platform.clone())
            .dimension("Workload", result.workload.as_str())
            .dimension("Processor", image.processor().as_str())
            .dimension("Python", image.python_version())
            .dimension("BuildContext", self.run.build_context.as_str());
        if let Some(instance_type) = &result.instance_type {
            metric = metric.dimension("InstanceType", instance_type.clone());
        }
        if let Some(commit) = &self.run.commit {
            metric = metric.dimension("CommitId", commit.clone());
        }
        metric
    }

    async fn upload(&self, store: &dyn ObjectStore, result: &TestResult) -> TelemetryResult<String> {
        let key = object_key(&self.config.base_prefix, &self.run.image, result);
        let reference = store
            .put(&key, result.output.clone().into_bytes())
            .await
            .map_err(TelemetryError::Upload)?;
        debug!(entry = %result.entry_id, log = %reference, "Uploaded log");
        Ok(reference)
    }

    async fn emit(&self, metrics: &[Metric]) -> TelemetryResult<()> {
        self.metrics
            .put_metrics(&self.config.namespace, metrics)
            .await
            .map_err(TelemetryError::Emit)
    }
}

/// `Test Duration` and `Test Errors` for one entry.
fn run_metrics(result: &TestResult) -> Vec<Metric> {
    let errors = if result.is_pass() { 0.0 } else { 1.0 };
    vec![
        Metric::new("Test Duration", result.duration().as_secs_f64(), "Seconds")
            .dimension("Test Path", result.entry_id.clone()),
        Metric::new("Test Errors", errors, "Count").dimension("Test Path", result.entry_id.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{MemoryMetrics, MemoryStore};
    use crate::config::ThresholdConfig;
    use crate::plan::{DataSource, Workload};

    const URI: &str = "pytorch-training:2.6.0-cpu-py312-ubuntu22.04-ec2";

    fn image() -> ImageDescriptor {
        ImageDescriptor::parse(URI).unwrap()
    }

    fn result(data_source: Option<DataSource>, output: &str) -> TestResult {
        let started_at = DateTime::parse_from_rfc3339("2026-03-01T12:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut result = TestResult::for_tests("training/0-vm-cpu", "vm-cpu", URI);
        result.data_source = data_source;
        result.workload = match data_source {
            Some(DataSource::Throughput) => Workload::BenchmarkThroughput,
            _ => Workload::Training,
        };
        result.output = output.to_string();
        result.started_at = started_at;
        result.ended_at = started_at + chrono::Duration::seconds(42);
        result
    }

    fn sink(
        store: Option<Arc<MemoryStore>>,
        metrics: Arc<MemoryMetrics>,
        rows: &[ThresholdConfig],
        executor_mode: bool,
    ) -> TelemetrySink {
        TelemetrySink::new(
            TelemetryConfig::default(),
            store.map(|s| s as Arc<dyn ObjectStore>),
            metrics,
            ThresholdTable::new(rows, true).unwrap(),
            RunContext {
                image: image(),
                build_context: BuildContext::Pr,
                commit: Some("abc123".into()),
                executor_mode,
            },
        )
    }

    fn floor(value: f64) -> ThresholdConfig {
        ThresholdConfig {
            framework: "pytorch".into(),
            versions: "*".into(),
            processor: "cpu".into(),
            workload: "benchmark-throughput".into(),
            value,
            metric: None,
            direction: None,
            unit: None,
        }
    }

    #[test]
    fn test_object_key() {
        let result = result(None, "");
        assert_eq!(
            object_key("dlc-test-logs/", &image(), &result),
            "dlc-test-logs/pytorch/2.6.0/vm-cpu/training/cpu/py312/2026-03-01-12-30-05.log"
        );
    }

    #[tokio::test]
    async fn test_threshold_breach_fails_result() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let sink = sink(Some(store.clone()), metrics.clone(), &[floor(1000.0)], true);

        let processed = sink
            .process(result(Some(DataSource::Throughput), "Throughput: 900 images/sec\n"))
            .await;

        assert_eq!(processed.status, TestStatus::Fail);
        assert_eq!(processed.failure, Some(FailureKind::ThresholdBreach));
        assert!(processed.message.as_ref().unwrap().contains("below threshold 1000"));

        let sent = metrics.metrics();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "Throughput");
        assert_eq!(sent[0].value, 900.0);
        assert_eq!(sent[0].unit, "images/sec");
        assert_eq!(sent[0].dimensions["Platform"], "vm-cpu");
        assert_eq!(sent[0].dimensions["CommitId"], "abc123");
        assert_eq!(metrics.namespaces(), vec!["DLCCI"]);

        assert_eq!(store.keys().len(), 1);
        assert_eq!(
            processed.logs_ref.as_deref(),
            Some("s3://test-bucket/dlc-test-logs/pytorch/2.6.0/vm-cpu/benchmark-throughput/cpu/py312/2026-03-01-12-30-05.log")
        );
    }

    #[tokio::test]
    async fn test_passing_benchmark_and_run_metrics() {
        let metrics = Arc::new(MemoryMetrics::new());
        let sink = sink(None, metrics.clone(), &[floor(800.0)], false);

        let processed = sink
            .process(result(Some(DataSource::Throughput), "images/sec: 900"))
            .await;

        assert_eq!(processed.status, TestStatus::Pass);
        assert!(processed.logs_ref.is_none());
        let names: Vec<String> = metrics.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["Throughput", "Test Duration", "Test Errors"]);
        let duration = &processed.metrics[1];
        assert_eq!(duration.value, 42.0);
        assert_eq!(duration.dimensions["Test Path"], "training/0-vm-cpu");
    }

    #[tokio::test]
    async fn test_skipped_results_pass_through() {
        let metrics = Arc::new(MemoryMetrics::new());
        let store = Arc::new(MemoryStore::new());
        let sink = sink(Some(store.clone()), metrics.clone(), &[], false);

        let mut skipped = result(None, "");
        skipped.status = TestStatus::Skip;
        let processed = sink.process(skipped).await;

        assert_eq!(processed.status, TestStatus::Skip);
        assert!(store.keys().is_empty());
        assert!(metrics.metrics().is_empty());
    }

    #[tokio::test]
    async fn test_consume_drains_channel() {
        let metrics = Arc::new(MemoryMetrics::new());
        let sink = sink(None, metrics, &[], true);
        let (tx, rx) = mpsc::channel(4);
        tx.send(result(None, "ok")).await.unwrap();
        tx.send(result(None, "ok")).await.unwrap();
        drop(tx);

        assert_eq!(sink.consume(rx).await.len(), 2);
    }

    #[tokio::test]
    async fn test_json_lines_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.jsonl");
        let backend = JsonLinesMetrics::new(&path);
        let metric = Metric::new("Throughput", 900.0, "images/sec").dimension("Platform", "vm-cpu");

        backend.put_metrics("DLCCI", &[metric.clone()]).await.unwrap();
        backend.put_metrics("DLCCI", &[metric]).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["Namespace"], "DLCCI");
        assert_eq!(lines[0]["MetricName"], "Throughput");
        assert_eq!(lines[0]["Dimensions"][0]["Name"], "Platform");
    }
}
