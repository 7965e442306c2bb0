//! Benchmark number extraction.
//!
//! Extractors scan the last N lines of an entry's log. The extractor is
//! picked by the entry's `data_source`:
//!
//! | Source | Matches | Metric | Direction |
//! |--------|---------|--------|-----------|
//! | `throughput` | `900 images/sec`, `images/sec: 900` (also samples, tokens) | `Throughput` | higher is better |
//! | `latency` | `p99: 12.5 ms`, `p99 latency 12.5ms` | `Latency` | lower is better |
//! | `cost` | `660 s/epoch`, `time per epoch: 660 seconds` | `Cost` | lower is better |
//!
//! When a pattern matches several lines the values are averaged, one
//! measurement per unit.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::plan::DataSource;

/// Whether a measurement passes by staying above or below its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Passes when `value >= threshold`.
    Min,
    /// Passes when `value <= threshold`.
    Max,
}

impl Direction {
    pub fn passes(&self, value: f64, threshold: f64) -> bool {
        match self {
            Direction::Min => value >= threshold,
            Direction::Max => value <= threshold,
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Direction::Min),
            "max" => Ok(Direction::Max),
            other => Err(format!("unknown direction '{}' (expected min or max)", other)),
        }
    }
}

/// One number read from a log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub direction: Direction,
}

const NUMBER: &str = r"([0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)";

static THROUGHPUT_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){}\s*(images|samples|tokens)\s*/\s*s(?:ec)?\b",
        NUMBER
    ))
    .expect("valid throughput regex")
});

static THROUGHPUT_BEFORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(images|samples|tokens)\s*/\s*s(?:ec)?\s*[:=]\s*{}",
        NUMBER
    ))
    .expect("valid throughput regex")
});

static LATENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bp99(?:\s+latency)?\s*[:=]?\s*{}\s*(ms|s)\b",
        NUMBER
    ))
    .expect("valid latency regex")
});

static COST_PER_EPOCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i){}\s*(?:s|sec|seconds)\s*/\s*epoch\b", NUMBER))
        .expect("valid cost regex")
});

static COST_EPOCH_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:time\s+per\s+epoch|epoch\s+time)\s*[:=]?\s*{}\s*(?:s|sec|seconds)?\b",
        NUMBER
    ))
    .expect("valid cost regex")
});

/// The last `n` lines of `log`.
pub fn tail(log: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

/// Runs the extractor for `source` over the last `tail_lines` lines.
pub fn extract(source: DataSource, log: &str, tail_lines: usize) -> Vec<Measurement> {
    let lines = tail(log, tail_lines);
    match source {
        DataSource::Throughput => throughput(&lines),
        DataSource::Latency => latency(&lines),
        DataSource::Cost => cost(&lines),
    }
}

fn throughput(lines: &[&str]) -> Vec<Measurement> {
    let mut samples = Samples::default();
    for line in lines {
        let found = THROUGHPUT_AFTER
            .captures(line)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .or_else(|| {
                THROUGHPUT_BEFORE
                    .captures(line)
                    .map(|c| (c[2].to_string(), c[1].to_string()))
            });
        if let Some((value, what)) = found
            && let Ok(value) = value.parse::<f64>()
        {
            samples.add(format!("{}/sec", what.to_ascii_lowercase()), value);
        }
    }
    samples.into_measurements("Throughput", Direction::Min)
}

fn latency(lines: &[&str]) -> Vec<Measurement> {
    let mut samples = Samples::default();
    for line in lines {
        if let Some(c) = LATENCY.captures(line)
            && let Ok(value) = c[1].parse::<f64>()
        {
            // Normalise to milliseconds.
            let value = if c[2].eq_ignore_ascii_case("s") {
                value * 1000.0
            } else {
                value
            };
            samples.add("ms".to_string(), value);
        }
    }
    samples.into_measurements("Latency", Direction::Max)
}

fn cost(lines: &[&str]) -> Vec<Measurement> {
    let mut samples = Samples::default();
    for line in lines {
        let capture = COST_PER_EPOCH
            .captures(line)
            .or_else(|| COST_EPOCH_TIME.captures(line));
        if let Some(c) = capture
            && let Ok(value) = c[1].parse::<f64>()
        {
            samples.add("s/epoch".to_string(), value);
        }
    }
    samples.into_measurements("Cost", Direction::Max)
}

/// Running sums per unit, in first-seen order.
#[derive(Default)]
struct Samples {
    by_unit: Vec<(String, f64, usize)>,
}

impl Samples {
    fn add(&mut self, unit: String, value: f64) {
        match self.by_unit.iter_mut().find(|(u, _, _)| *u == unit) {
            Some((_, total, count)) => {
                *total += value;
                *count += 1;
            }
            None => self.by_unit.push((unit, value, 1)),
        }
    }

    fn into_measurements(self, name: &str, direction: Direction) -> Vec<Measurement> {
        self.by_unit
            .into_iter()
            .map(|(unit, total, count)| Measurement {
                name: name.to_string(),
                value: total / count as f64,
                unit,
                direction,
            })
            .collect()
    }
}
