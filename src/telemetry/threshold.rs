//! Benchmark threshold table.
//!
//! Rows are keyed by `(framework, version range, processor, workload)` and
//! optionally by metric name and unit. Configured rows are consulted before
//! the built-in floors, and the first matching row wins. A measurement whose
//! unit no row covers is not judged: an images/sec floor says nothing about
//! tokens/sec.

use semver::VersionReq;
use tracing::warn;

use super::extract::{Direction, Measurement};
use super::{TelemetryError, TelemetryResult};
use crate::config::ThresholdConfig;
use crate::image::{ImageDescriptor, Processor};
use crate::plan::Workload;

/// One row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub framework: String,
    pub versions: VersionReq,
    pub processor: Processor,
    pub workload: Workload,
    /// Restricts the row to one metric name; `None` matches any.
    pub metric: Option<String>,
    /// Restricts the row to one unit; `None` matches any.
    pub unit: Option<String>,
    pub value: f64,
    /// Overrides the measurement's own direction.
    pub direction: Option<Direction>,
}

impl Threshold {
    fn matches(
        &self,
        framework: &str,
        version: Option<&semver::Version>,
        processor: Processor,
        workload: Workload,
        metric: &str,
        unit: Option<&str>,
    ) -> bool {
        let version_ok = match version {
            Some(v) => self.versions.matches(v),
            None => self.versions == VersionReq::STAR,
        };
        self.framework.eq_ignore_ascii_case(framework)
            && version_ok
            && self.processor == processor
            && self.workload == workload
            && self.metric.as_deref().is_none_or(|m| m == metric)
            && unit.is_none_or(|u| {
                self.unit.as_deref().is_none_or(|ru| ru.eq_ignore_ascii_case(u))
            })
    }
}

/// Outcome of checking one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub threshold: f64,
    pub direction: Direction,
    pub passed: bool,
}

/// Ordered threshold rows.
#[derive(Debug, Clone, Default)]
pub struct ThresholdTable {
    rows: Vec<Threshold>,
}

/// Known benchmark floors and ceilings.
///
/// `(framework, versions, processor, workload, metric, unit, value)`.
const BUILTIN: &[(&str, &str, Processor, Workload, &str, &str, f64)] = &[
    ("pytorch", "*", Processor::Gpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 2400.0),
    ("pytorch", "*", Processor::Gpu, Workload::Training, "Cost", "s/epoch", 660.0),
    ("tensorflow", ">=2", Processor::Cpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 50.0),
    ("tensorflow", ">=2", Processor::Gpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 7000.0),
    ("tensorflow", "<2", Processor::Cpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 50.0),
    ("tensorflow", "<2", Processor::Gpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 5000.0),
    ("mxnet", "*", Processor::Cpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 1000.0),
    ("mxnet", "*", Processor::Gpu, Workload::BenchmarkThroughput, "Throughput", "images/sec", 4500.0),
    ("mxnet", "*", Processor::Gpu, Workload::Training, "Cost", "s/epoch", 120.0),
];

impl ThresholdTable {
    /// Configured rows first, then the built-ins unless disabled.
    pub fn new(configured: &[ThresholdConfig], builtin: bool) -> TelemetryResult<Self> {
        let mut rows = configured
            .iter()
            .map(parse_row)
            .collect::<TelemetryResult<Vec<_>>>()?;

        if builtin {
            for &(framework, versions, processor, workload, metric, unit, value) in BUILTIN {
                rows.push(Threshold {
                    framework: framework.to_string(),
                    versions: VersionReq::parse(versions)
                        .map_err(|e| TelemetryError::Threshold(e.to_string()))?,
                    processor,
                    workload,
                    metric: Some(metric.to_string()),
                    unit: Some(unit.to_string()),
                    value,
                    direction: None,
                });
            }
        }

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Threshold] {
        &self.rows
    }

    /// The first row that applies to a `metric` in `unit` for this image.
    pub fn lookup(
        &self,
        image: &ImageDescriptor,
        workload: Workload,
        metric: &str,
        unit: &str,
    ) -> Option<&Threshold> {
        self.find(image, workload, metric, Some(unit))
    }

    fn find(
        &self,
        image: &ImageDescriptor,
        workload: Workload,
        metric: &str,
        unit: Option<&str>,
    ) -> Option<&Threshold> {
        let version = image.semver();
        self.rows.iter().find(|row| {
            row.matches(
                &image.framework,
                version.as_ref(),
                image.processor(),
                workload,
                metric,
                unit,
            )
        })
    }

    /// Compares a measurement with its row, if there is one.
    pub fn check(
        &self,
        image: &ImageDescriptor,
        workload: Workload,
        measurement: &Measurement,
    ) -> Option<Verdict> {
        let Some(row) = self.lookup(image, workload, &measurement.name, &measurement.unit) else {
            if let Some(other) = self.find(image, workload, &measurement.name, None) {
                warn!(
                    metric = %measurement.name,
                    unit = %measurement.unit,
                    threshold_unit = other.unit.as_deref().unwrap_or_default(),
                    "No threshold for this unit, not judging the measurement"
                );
            }
            return None;
        };
        let direction = row.direction.unwrap_or(measurement.direction);
        Some(Verdict {
            threshold: row.value,
            direction,
            passed: direction.passes(measurement.value, row.value),
        })
    }
}

fn parse_row(row: &ThresholdConfig) -> TelemetryResult<Threshold> {
    let bad = |what: String| {
        TelemetryError::Threshold(format!(
            "{}/{}/{}: {}",
            row.framework, row.processor, row.workload, what
        ))
    };

    Ok(Threshold {
        framework: row.framework.clone(),
        versions: VersionReq::parse(&row.versions)
            .map_err(|e| bad(format!("invalid versions '{}': {}", row.versions, e)))?,
        processor: row.processor.parse().map_err(bad)?,
        workload: row.workload.parse().map_err(bad)?,
        metric: row.metric.clone(),
        unit: row.unit.clone(),
        value: row.value,
        direction: row
            .direction
            .as_deref()
            .map(str::parse::<Direction>)
            .transpose()
            .map_err(bad)?,
    })
}
