//! JUnit XML report generation.
//!
//! One file per image run, named from the `[report] junit_file` pattern
//! with `{image}` replaced by the buildspec image name:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" skipped="0" time="912.402">
//!   <testsuite name="pytorch-training" tests="3" failures="1" errors="1" skipped="0" time="912.402">
//!     <testcase classname="pytorch-training.vm-gpu" name="0-vm-gpu" time="401.100"/>
//!     <testcase classname="pytorch-training.vm-gpu" name="1-vm-gpu" time="380.750">
//!       <failure message="Throughput 900 images/sec is below threshold 1000" type="ThresholdBreach">...</failure>
//!     </testcase>
//!     <testcase classname="pytorch-training.kube-gpu" name="2-kube-gpu" time="130.552">
//!       <error message="no capacity for p4d.24xlarge" type="CapacityUnavailable"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! `fail` maps to `<failure>`, `infra-error` to `<error>` and `skip` to
//! `<skipped>`. Failure bodies carry the tail of the entry's output.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::dispatcher::{TestResult, TestStatus};
use crate::orchestrator::RunResult;
use crate::telemetry::extract::tail;

/// Lines of entry output kept in a failure body.
const OUTPUT_TAIL_LINES: usize = 100;

/// Writes a JUnit XML file when each image run completes.
pub struct JUnitReporter {
    output_dir: PathBuf,
    file_pattern: String,
}

impl JUnitReporter {
    /// `file_pattern` may contain `{image}`.
    pub fn new(output_dir: impl Into<PathBuf>, file_pattern: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            file_pattern: file_pattern.into(),
        }
    }

    /// Where the report for `image_name` goes.
    pub fn path_for(&self, image_name: &str) -> PathBuf {
        self.output_dir
            .join(self.file_pattern.replace("{image}", image_name))
    }

    fn generate_xml(&self, run: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = run.results.len().to_string();
        let failures = run.failed().to_string();
        let errors = run.infra_errors().to_string();
        let skipped = run.skipped().to_string();
        let time = format!("{:.3}", run.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("skipped", skipped.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", run.image_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", run.started_at.to_rfc3339().as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in &run.results {
            write_testcase(&mut writer, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write(&self, run: &RunResult) -> anyhow::Result<PathBuf> {
        let xml = self.generate_xml(run)?;
        let path = self.path_for(&run.image_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, xml)?;
        Ok(path)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
) -> anyhow::Result<()> {
    let classname = format!("{}.{}", result.image_name, result.platform);
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", result.stage.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration().as_secs_f64()).as_str(),
    ));

    let element = match result.status {
        TestStatus::Pass => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestStatus::Fail => "failure",
        TestStatus::InfraError => "error",
        TestStatus::Skip => "skipped",
    };

    writer.write_event(Event::Start(testcase))?;

    let message = sanitize(result.message.as_deref().unwrap_or_default());
    let mut child = BytesStart::new(element);
    child.push_attribute(("message", message.as_str()));
    if let Some(kind) = result.failure {
        child.push_attribute(("type", kind.as_str()));
    }

    let body = sanitize(&tail(&result.output, OUTPUT_TAIL_LINES).join("\n"));
    if result.status == TestStatus::Skip || body.is_empty() {
        writer.write_event(Event::Empty(child))?;
    } else {
        writer.write_event(Event::Start(child))?;
        writer.write_event(Event::Text(BytesText::new(&body)))?;
        writer.write_event(Event::End(BytesEnd::new(element)))?;
    }

    if let Some(log) = result.logs_ref.as_deref().or(result
        .log_file
        .as_deref()
        .and_then(Path::to_str))
    {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&format!("log: {}", log))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_complete(&self, result: &RunResult) {
        match self.write(result) {
            Ok(path) => tracing::info!("JUnit XML written to: {}", path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FailureKind;
    use crate::cleanup::CleanupReport;
    use std::time::Duration;

    const URI: &str = "123.dkr.ecr.us-west-2.amazonaws.com/pytorch-training:2.6.0-gpu-py312-cu124-ubuntu22.04-ec2";

    fn run(results: Vec<TestResult>) -> RunResult {
        RunResult {
            image: URI.to_string(),
            image_name: "pytorch-training".to_string(),
            run_id: "0123456789abcdef".to_string(),
            started_at: chrono::Utc::now(),
            duration: Duration::from_millis(1500),
            results,
            cleanup: CleanupReport::default(),
        }
    }

    #[test]
    fn test_xml_shape() {
        let pass = TestResult::for_tests("pytorch-training/0-vm-gpu", "vm-gpu", URI);
        let mut fail = TestResult::for_tests("pytorch-training/1-vm-gpu", "vm-gpu", URI);
        fail.fail(FailureKind::ThresholdBreach, "Throughput 900 images/sec is below threshold 1000");
        fail.output = "step 1\nThroughput: 900 images/sec <done>\n".to_string();
        let mut infra = TestResult::for_tests("pytorch-training/2-kube-gpu", "kube-gpu", URI);
        infra.fail(FailureKind::CapacityUnavailable, "no capacity");

        let reporter = JUnitReporter::new("out", "junit-{image}.xml");
        let xml = reporter.generate_xml(&run(vec![pass, fail, infra])).unwrap();

        assert!(xml.contains(r#"<testsuite name="pytorch-training" tests="3" failures="1" errors="1" skipped="0""#));
        assert!(xml.contains(r#"<testcase classname="pytorch-training.vm-gpu" name="0-vm-gpu""#));
        assert!(xml.contains(r#"type="ThresholdBreach""#));
        assert!(xml.contains("900 images/sec &lt;done&gt;"));
        assert!(xml.contains(r#"<error message="no capacity" type="CapacityUnavailable"/>"#));
    }

    #[test]
    fn test_skip_is_empty_element() {
        let mut skip = TestResult::for_tests("pytorch-training/0-vm-cpu", "vm-cpu", URI);
        skip.status = TestStatus::Skip;
        skip.message = Some("platform vm-cpu targets cpu images, image is gpu".into());

        let xml = JUnitReporter::new("out", "x.xml").generate_xml(&run(vec![skip])).unwrap();
        assert!(xml.contains(r#"<skipped message="platform vm-cpu targets cpu images, image is gpu"/>"#));
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize("a\u{0}b\u{1b}[0mc\n"), "ab[0mc\n");
    }

    #[tokio::test]
    async fn test_writes_file_from_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JUnitReporter::new(dir.path().join("reports"), "junit-{image}.xml");

        reporter
            .on_run_complete(&run(vec![TestResult::for_tests("pytorch-training/0-vm-gpu", "vm-gpu", URI)]))
            .await;

        let path = dir.path().join("reports/junit-pytorch-training.xml");
        assert_eq!(reporter.path_for("pytorch-training"), path);
        let xml = std::fs::read_to_string(path).unwrap();
        assert!(xml.starts_with("<?xml"));
    }
}
