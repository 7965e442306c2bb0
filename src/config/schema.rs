//! Configuration schema definitions for dlc-orchestrator.
//!
//! This module defines all configuration types that can be deserialized from
//! the optional TOML settings file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig     - Tag prefix, parallelism, log dir, release timeout
//! ├── ProviderConfig         - Retry policy, instance defaults, AMIs, zone overrides
//! ├── RemoteConfig           - SSH connection retries and command timeout
//! ├── KubernetesConfig       - Pod readiness polling
//! ├── ServingConfig          - HTTP readiness polling for served models
//! ├── TelemetryConfig        - Metric namespace, log bucket, extractor window
//! ├── ThresholdConfig[]      - Extra benchmark threshold rows
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [orchestrator]
/// tag_prefix = "dlc-ci"
/// max_parallel = 10
///
/// [provider]
/// iam_instance_profile = "ec2TestInstanceRole"
///
/// [provider.amis]
/// x86 = "ami-0123456789abcdef0"
///
/// [[provider.zone_overrides]]
/// instance_type = "p5.48xlarge"
/// region = "us-east-1"
/// zones = ["us-east-1a"]
///
/// [telemetry]
/// bucket = "dlc-test-logs"
///
/// [[thresholds]]
/// framework = "pytorch"
/// versions = ">=2.0"
/// processor = "gpu"
/// workload = "benchmark-throughput"
/// value = 2400.0
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    #[serde(default)]
    pub serving: ServingConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Threshold rows added to the built-in table.
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `tag_prefix` | `"dlc-ci"` |
/// | `max_parallel` | 10 |
/// | `log_dir` | `"logs"` |
/// | `release_timeout_secs` | 600 (10 minutes) |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Prefix for every resource name and `Name` tag the run creates.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Upper bound on concurrently running entries of one parallel group.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Directory receiving `<image-name>-<stage>` log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Deadline for each individual release during cleanup.
    #[serde(default = "default_release_timeout")]
    pub release_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            max_parallel: default_max_parallel(),
            log_dir: default_log_dir(),
            release_timeout_secs: default_release_timeout(),
        }
    }
}

fn default_tag_prefix() -> String {
    "dlc-ci".to_string()
}

fn default_max_parallel() -> usize {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_release_timeout() -> u64 {
    600
}

/// Cloud resource provisioning settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `retry_attempts` | 10 |
/// | `retry_max_delay_secs` | 60 |
/// | `instance_ready_timeout_secs` | 960 (16 minutes) |
/// | `resource_ready_timeout_secs` | 3600 (clusters, filesystems) |
/// | `ssh_user` | `"ec2-user"` |
/// | `volume_size_gb` | 600 |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Attempts for transient cloud errors (throttling, 5xx).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Cap on the exponential backoff between attempts.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,

    /// Deadline for instances to pass both status checks.
    #[serde(default = "default_instance_ready_timeout")]
    pub instance_ready_timeout_secs: u64,

    /// Deadline for clusters, nodegroups, filesystems and services.
    #[serde(default = "default_resource_ready_timeout")]
    pub resource_ready_timeout_secs: u64,

    /// Polling interval of every provisioning waiter.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Instance profile attached to test instances.
    #[serde(default = "default_iam_profile")]
    pub iam_instance_profile: String,

    /// Login user on test instances.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Root volume size in GiB.
    #[serde(default = "default_volume_size")]
    pub volume_size_gb: i32,

    /// Root volume IOPS.
    #[serde(default = "default_volume_iops")]
    pub volume_iops: i32,

    /// Root volume throughput in MiB/s.
    #[serde(default = "default_volume_throughput")]
    pub volume_throughput: i32,

    /// Directory where generated private keys are written.
    ///
    /// Default: the system temporary directory.
    #[serde(default)]
    pub key_dir: Option<PathBuf>,

    /// Default AMIs per architecture, used when an entry sets no `ami_id`.
    #[serde(default)]
    pub amis: AmiConfig,

    /// Instance profile for ECS container instances.
    #[serde(default = "default_ecs_instance_profile")]
    pub ecs_instance_profile: String,

    /// Zone allowlists that replace discovery for capacity-constrained types.
    #[serde(default)]
    pub zone_overrides: Vec<ZoneOverride>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_max_delay_secs: default_retry_max_delay(),
            instance_ready_timeout_secs: default_instance_ready_timeout(),
            resource_ready_timeout_secs: default_resource_ready_timeout(),
            poll_interval_secs: default_poll_interval(),
            iam_instance_profile: default_iam_profile(),
            ssh_user: default_ssh_user(),
            volume_size_gb: default_volume_size(),
            volume_iops: default_volume_iops(),
            volume_throughput: default_volume_throughput(),
            key_dir: None,
            amis: AmiConfig::default(),
            ecs_instance_profile: default_ecs_instance_profile(),
            zone_overrides: Vec::new(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_max_delay() -> u64 {
    60
}

fn default_instance_ready_timeout() -> u64 {
    960
}

fn default_resource_ready_timeout() -> u64 {
    3600
}

fn default_poll_interval() -> u64 {
    15
}

fn default_iam_profile() -> String {
    "ec2TestInstanceRole".to_string()
}

fn default_ecs_instance_profile() -> String {
    "ecsInstanceRole".to_string()
}

fn default_ssh_user() -> String {
    "ec2-user".to_string()
}

fn default_volume_size() -> i32 {
    600
}

fn default_volume_iops() -> i32 {
    3000
}

fn default_volume_throughput() -> i32 {
    125
}

/// Default AMI per architecture.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AmiConfig {
    #[serde(default)]
    pub x86: Option<String>,
    #[serde(default)]
    pub arm64: Option<String>,
    #[serde(default)]
    pub graviton: Option<String>,
    /// ECS-optimized AMI for container instances.
    #[serde(default)]
    pub ecs: Option<String>,
}

/// Availability-zone allowlist for one instance type in one region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneOverride {
    pub instance_type: String,
    pub region: String,
    pub zones: Vec<String>,
}

/// Remote execution settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `connect_attempts` | 16 |
/// | `connect_interval_secs` | 60 |
/// | `command_timeout_secs` | 1800 (30 minutes) |
/// | `disable_host_key_check` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_interval")]
    pub connect_interval_secs: u64,

    /// Applied to every command that sets no timeout of its own.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Test hosts are fresh instances with unknown host keys.
    #[serde(default = "default_true")]
    pub disable_host_key_check: bool,

    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_interval_secs: default_connect_interval(),
            command_timeout_secs: default_command_timeout(),
            disable_host_key_check: true,
            port: default_ssh_port(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    16
}

fn default_connect_interval() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    1800
}

fn default_ssh_port() -> u16 {
    22
}

/// Kubernetes readiness settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesConfig {
    /// Default: 300 (5 minutes)
    #[serde(default = "default_pod_poll_interval")]
    pub ready_poll_interval_secs: u64,

    /// Default: 12000 (200 minutes)
    #[serde(default = "default_pod_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Binary used for every cluster call.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval_secs: default_pod_poll_interval(),
            ready_timeout_secs: default_pod_ready_timeout(),
            kubectl: default_kubectl(),
        }
    }
}

fn default_pod_poll_interval() -> u64 {
    300
}

fn default_pod_ready_timeout() -> u64 {
    12000
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

/// Readiness polling for served models.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServingConfig {
    /// Default: 30
    #[serde(default = "default_serving_poll_interval")]
    pub poll_interval_secs: u64,

    /// Default: 2100 (35 minutes)
    #[serde(default = "default_serving_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Per-request timeout of each probe.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_serving_poll_interval(),
            ready_timeout_secs: default_serving_ready_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_serving_poll_interval() -> u64 {
    30
}

fn default_serving_ready_timeout() -> u64 {
    2100
}

fn default_request_timeout() -> u64 {
    60
}

/// Result upload and metric emission.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// CloudWatch namespace.
    ///
    /// Default: `"DLCCI"`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bucket receiving raw logs. Uploads are skipped when unset.
    #[serde(default)]
    pub bucket: Option<String>,

    /// First path segment of every uploaded log key.
    #[serde(default = "default_base_prefix")]
    pub base_prefix: String,

    /// How many trailing log lines extractors scan.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Append metric payloads to this JSON-lines file instead of CloudWatch.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    /// Skip the built-in threshold rows.
    #[serde(default)]
    pub disable_builtin_thresholds: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            bucket: None,
            base_prefix: default_base_prefix(),
            tail_lines: default_tail_lines(),
            metrics_file: None,
            disable_builtin_thresholds: false,
        }
    }
}

fn default_namespace() -> String {
    "DLCCI".to_string()
}

fn default_base_prefix() -> String {
    "dlc-test-logs".to_string()
}

fn default_tail_lines() -> usize {
    200
}

/// One threshold row.
///
/// `versions` is a semver requirement such as `">=2.0, <2.4"`; `direction`
/// defaults to the metric's natural direction (`min` for throughput, `max`
/// for latency and cost). `unit` (`images/sec`, `tokens/sec`, `ms`,
/// `s/epoch`) restricts the row to measurements reported in that unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdConfig {
    pub framework: String,
    #[serde(default = "default_versions")]
    pub versions: String,
    pub processor: String,
    pub workload: String,
    pub value: f64,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_versions() -> String {
    "*".to_string()
}

/// Configuration for test result reporting.
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "build/test-results"
/// junit = true
/// junit_file = "results-{image}.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Directory where report files are written.
    ///
    /// Default: `"test-results"`
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report per run.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename pattern for the JUnit XML report; `{image}` is replaced by
    /// the image name.
    ///
    /// Default: `"junit-{image}.xml"`
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit-{image}.xml".to_string()
}
