//! The normalized test plan.
//!
//! A [`TestPlan`] is what the buildspec loader produces and the dispatcher
//! consumes: the global context of the buildspec plus one [`TestEntry`] per
//! row of the test matrix, in declaration order. Plans are immutable once
//! built.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::image::{Arch, ImageDescriptor, JobType, Processor};

/// Platform family an invocation targets (`TEST_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformFamily {
    /// Bare compute instances reached over SSH.
    Vm,
    /// Managed container clusters (ECS).
    ContainerCluster,
    /// Managed Kubernetes (EKS).
    Kubernetes,
}

impl PlatformFamily {
    pub const ALL: [PlatformFamily; 3] = [
        PlatformFamily::Vm,
        PlatformFamily::ContainerCluster,
        PlatformFamily::Kubernetes,
    ];

    /// Platform tag prefixes that belong to this family.
    pub fn tag_prefixes(&self) -> &'static [&'static str] {
        match self {
            PlatformFamily::Vm => &["vm", "ec2"],
            PlatformFamily::ContainerCluster => &["ecs", "container-cluster"],
            PlatformFamily::Kubernetes => &["kube", "eks", "kubernetes"],
        }
    }

    /// Finds the family a platform tag belongs to.
    pub fn of_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.matches_tag(tag))
    }

    /// Returns true when `tag` starts with one of this family's prefixes.
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tag_prefixes().iter().any(|prefix| {
            tag == *prefix
                || tag
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('-'))
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformFamily::Vm => "vm",
            PlatformFamily::ContainerCluster => "container-cluster",
            PlatformFamily::Kubernetes => "kubernetes",
        }
    }
}

impl FromStr for PlatformFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vm" | "ec2" => Ok(PlatformFamily::Vm),
            "container-cluster" | "ecs" => Ok(PlatformFamily::ContainerCluster),
            "kubernetes" | "kube" | "eks" => Ok(PlatformFamily::Kubernetes),
            other => Err(format!(
                "unknown test type '{}' (expected vm, container-cluster or kubernetes)",
                other
            )),
        }
    }
}

impl fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform tag such as `vm-gpu` resolved to its family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub tag: String,
    pub family: PlatformFamily,
    /// Processor named by the tag, when the tag names one.
    pub processor: Option<Processor>,
}

impl Platform {
    /// Resolves a tag, returning `None` for tags outside every known family.
    pub fn parse(tag: &str) -> Option<Self> {
        let family = PlatformFamily::of_tag(tag)?;
        let processor = family
            .tag_prefixes()
            .iter()
            .find_map(|prefix| tag.strip_prefix(prefix)?.strip_prefix('-'))
            .and_then(|rest| rest.split('-').next())
            .and_then(|token| token.parse().ok());

        Some(Self {
            tag: tag.to_string(),
            family,
            processor,
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Extractor selection for benchmark entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Throughput,
    Latency,
    Cost,
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "throughput" => Ok(DataSource::Throughput),
            "latency" => Ok(DataSource::Latency),
            "cost" => Ok(DataSource::Cost),
            other => Err(format!(
                "unknown data_source '{}' (expected throughput, latency or cost)",
                other
            )),
        }
    }
}

/// Semantic test family used in object keys and threshold lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Workload {
    Training,
    Inference,
    BenchmarkThroughput,
    BenchmarkLatency,
    Sanity,
}

impl Workload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Training => "training",
            Workload::Inference => "inference",
            Workload::BenchmarkThroughput => "benchmark-throughput",
            Workload::BenchmarkLatency => "benchmark-latency",
            Workload::Sanity => "sanity",
        }
    }
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(Workload::Training),
            "inference" => Ok(Workload::Inference),
            "benchmark-throughput" => Ok(Workload::BenchmarkThroughput),
            "benchmark-latency" => Ok(Workload::BenchmarkLatency),
            "sanity" => Ok(Workload::Sanity),
            other => Err(format!("unknown workload '{}'", other)),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applicability filters declared on a test.
///
/// Every filter that is present must match the image for the entry to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selectors {
    pub framework_version: Option<semver::VersionReq>,
    pub processor: Vec<Processor>,
    pub arch: Vec<Arch>,
    pub job_type: Vec<JobType>,
}

impl Selectors {
    /// Returns `Err(reason)` when the image falls outside these filters.
    pub fn evaluate(&self, image: &ImageDescriptor) -> Result<(), String> {
        if let Some(req) = &self.framework_version {
            match image.semver() {
                Some(version) if req.matches(&version) => {}
                Some(version) => {
                    return Err(format!("framework version {} does not satisfy '{}'", version, req));
                }
                None => {
                    return Err(format!(
                        "framework version '{}' is not comparable with '{}'",
                        image.framework_version(),
                        req
                    ));
                }
            }
        }
        if !self.processor.is_empty() && !self.processor.contains(&image.processor()) {
            return Err(format!("processor {} not selected", image.processor()));
        }
        if !self.arch.is_empty() && !self.arch.contains(&image.arch) {
            return Err(format!("architecture {} not selected", image.arch));
        }
        if !self.job_type.is_empty() && !self.job_type.contains(&image.job_type) {
            return Err(format!("job type {} not selected", image.job_type));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.framework_version.is_none()
            && self.processor.is_empty()
            && self.arch.is_empty()
            && self.job_type.is_empty()
    }
}

/// The `params` map of a test, with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// A string parameter; empty strings count as absent.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// An unsigned integer parameter, accepting numeric strings.
    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// A boolean parameter, accepting `"true"`/`"false"` strings.
    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.bool(key).unwrap_or(false)
    }

    /// A list of strings; a single string is treated as a one-item list.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| scalar_to_string(v))
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// A map of string values, e.g. container environment variables.
    pub fn string_map(&self, key: &str) -> BTreeMap<String, String> {
        match self.0.get(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Renders a scalar parameter as text.
    pub fn render(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(scalar_to_string)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` into `self`; keys in `other` win.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Buildspec-wide values attached to every entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalContext {
    pub framework: String,
    pub region: String,
    pub account_id: String,
    pub arch_type: Arch,
}

impl GlobalContext {
    /// The globals as parameters, merged over every entry's params.
    pub fn as_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("framework", self.framework.clone());
        params.insert("region", self.region.clone());
        params.insert("account_id", self.account_id.clone());
        params.insert("arch_type", self.arch_type.as_str());
        params
    }
}

/// One image declared in the buildspec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSpec {
    pub name: String,
    pub repository: String,
    pub tag: Option<String>,
    pub docker_file: Option<String>,
    pub device_type: Option<Processor>,
    pub python_version: Option<String>,
}

impl ImageSpec {
    /// Returns true when this buildspec image describes `image`.
    pub fn matches(&self, image: &ImageDescriptor) -> bool {
        let declared = self
            .repository
            .split_once('/')
            .filter(|(host, _)| host.contains('.'))
            .map(|(_, rest)| rest)
            .unwrap_or(&self.repository);
        declared == image.repository
            || image
                .registry
                .as_ref()
                .is_some_and(|host| format!("{}/{}", host, image.repository) == self.repository)
    }
}

/// One row of the test matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestEntry {
    /// `<image-name>/<index>-<platform>`, unique within a plan.
    pub id: String,
    pub image_name: String,
    /// Position of the test within its image's `tests` list.
    pub index: usize,
    pub platform: Platform,
    pub params: Params,
    pub run: Vec<String>,
    pub data_source: Option<DataSource>,
    #[serde(skip)]
    pub selectors: Selectors,
    pub parallel_group: Option<String>,
}

impl TestEntry {
    /// Stage name used for log files: `<index>-<platform>`.
    pub fn stage(&self) -> String {
        format!("{}-{}", self.index, self.platform.tag)
    }

    /// The workload this entry exercises for the given image.
    pub fn workload(&self, image: &ImageDescriptor) -> Workload {
        if let Some(workload) = self.params.str("workload").and_then(|w| w.parse().ok()) {
            return workload;
        }
        match self.data_source {
            Some(DataSource::Throughput) => Workload::BenchmarkThroughput,
            Some(DataSource::Latency) => Workload::BenchmarkLatency,
            Some(DataSource::Cost) => Workload::Training,
            None => match image.job_type {
                JobType::Training => Workload::Training,
                JobType::Inference => Workload::Inference,
            },
        }
    }

    /// `params ∪ globals ∪ {image_uri}`; globals override params and the
    /// image URI overrides both.
    pub fn setup_params(&self, globals: &GlobalContext, image_uri: &str) -> Params {
        let mut params = self.params.clone();
        params.merge(&globals.as_params());
        params.insert("image_uri", image_uri);
        params
    }
}

/// The complete, validated test plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPlan {
    pub globals: GlobalContext,
    pub images: Vec<ImageSpec>,
    pub entries: Vec<TestEntry>,
}

impl TestPlan {
    /// Picks the buildspec image that describes `image`.
    ///
    /// A buildspec with a single image matches any URI.
    pub fn image_for(&self, image: &ImageDescriptor) -> Option<&ImageSpec> {
        self.images
            .iter()
            .find(|spec| spec.matches(image))
            .or_else(|| match self.images.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }

    /// Entries declared under the named buildspec image.
    pub fn entries_for(&self, image_name: &str) -> Vec<&TestEntry> {
        self.entries
            .iter()
            .filter(|e| e.image_name == image_name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(uri: &str) -> ImageDescriptor {
        ImageDescriptor::parse(uri).unwrap()
    }

    #[test]
    fn test_family_prefix_matching() {
        assert_eq!(PlatformFamily::of_tag("vm-gpu"), Some(PlatformFamily::Vm));
        assert_eq!(PlatformFamily::of_tag("ec2-cpu"), Some(PlatformFamily::Vm));
        assert_eq!(
            PlatformFamily::of_tag("ecs-cpu"),
            Some(PlatformFamily::ContainerCluster)
        );
        assert_eq!(
            PlatformFamily::of_tag("kube-gpu-multinode"),
            Some(PlatformFamily::Kubernetes)
        );
        assert_eq!(PlatformFamily::of_tag("vmware"), None);
        assert_eq!(PlatformFamily::of_tag("lambda-cpu"), None);
    }

    #[test]
    fn test_parse_test_type() {
        assert_eq!("vm".parse(), Ok(PlatformFamily::Vm));
        assert_eq!(
            "container-cluster".parse(),
            Ok(PlatformFamily::ContainerCluster)
        );
        assert_eq!("EKS".parse(), Ok(PlatformFamily::Kubernetes));
        assert!("sagemaker".parse::<PlatformFamily>().is_err());
    }

    #[test]
    fn test_platform_processor() {
        let platform = Platform::parse("kube-gpu").unwrap();
        assert_eq!(platform.family, PlatformFamily::Kubernetes);
        assert_eq!(platform.processor, Some(Processor::Gpu));

        let platform = Platform::parse("container-cluster-neuron").unwrap();
        assert_eq!(platform.processor, Some(Processor::Neuron));

        let platform = Platform::parse("vm-multinode").unwrap();
        assert_eq!(platform.processor, None);
    }

    #[test]
    fn test_selectors() {
        let gpu = image("pytorch-training:2.6.0-gpu-cu124-py312-ubuntu22.04");
        let cpu = image("pytorch-training:2.4.0-cpu-py311-ubuntu22.04");

        let selectors = Selectors {
            framework_version: Some(semver::VersionReq::parse(">=2.5").unwrap()),
            processor: vec![Processor::Gpu],
            ..Default::default()
        };

        assert!(selectors.evaluate(&gpu).is_ok());
        let reason = selectors.evaluate(&cpu).unwrap_err();
        assert!(reason.contains("2.4.0"), "{}", reason);
        assert!(Selectors::default().evaluate(&cpu).is_ok());
    }

    #[test]
    fn test_params_accessors() {
        let params: Params = [
            ("instance_type".to_string(), json!("c5.9xlarge")),
            ("node_count".to_string(), json!(2)),
            ("count_str".to_string(), json!("3")),
            ("efa".to_string(), json!("true")),
            ("ports".to_string(), json!([8080, "8081"])),
            ("env".to_string(), json!({"A": "1", "B": 2})),
            ("empty".to_string(), json!("")),
        ]
        .into_iter()
        .collect();

        assert_eq!(params.str("instance_type"), Some("c5.9xlarge"));
        assert_eq!(params.u64("node_count"), Some(2));
        assert_eq!(params.u64("count_str"), Some(3));
        assert!(params.flag("efa"));
        assert!(!params.flag("missing"));
        assert_eq!(params.string_list("ports"), vec!["8080", "8081"]);
        assert_eq!(params.string_map("env").get("B").map(String::as_str), Some("2"));
        assert_eq!(params.str("empty"), None);
    }

    #[test]
    fn test_setup_params_precedence() {
        let globals = GlobalContext {
            framework: "pytorch".into(),
            region: "us-west-2".into(),
            account_id: "123456789012".into(),
            arch_type: Arch::X86,
        };
        let mut params = Params::new();
        params.insert("region", "eu-west-1");
        params.insert("image_uri", "<placeholder>");
        params.insert("instance_type", "c5.9xlarge");

        let entry = TestEntry {
            id: "img/0-vm-cpu".into(),
            image_name: "img".into(),
            index: 0,
            platform: Platform::parse("vm-cpu").unwrap(),
            params,
            run: vec!["true".into()],
            data_source: None,
            selectors: Selectors::default(),
            parallel_group: None,
        };

        let merged = entry.setup_params(&globals, "repo:1.0-cpu-py3-al2");
        assert_eq!(merged.str("region"), Some("us-west-2"));
        assert_eq!(merged.str("image_uri"), Some("repo:1.0-cpu-py3-al2"));
        assert_eq!(merged.str("instance_type"), Some("c5.9xlarge"));
        assert_eq!(merged.str("arch_type"), Some("x86"));
    }

    #[test]
    fn test_image_spec_matching() {
        let spec = ImageSpec {
            name: "training".into(),
            repository: "123456789012.dkr.ecr.us-west-2.amazonaws.com/pytorch-training".into(),
            tag: None,
            docker_file: None,
            device_type: None,
            python_version: None,
        };
        assert!(spec.matches(&image(
            "123456789012.dkr.ecr.us-west-2.amazonaws.com/pytorch-training:2.6.0-cpu-py312-ubuntu22.04"
        )));
        assert!(spec.matches(&image("pytorch-training:2.6.0-cpu-py312-ubuntu22.04")));
        assert!(!spec.matches(&image("pytorch-inference:2.6.0-cpu-py312-ubuntu22.04")));
    }
}
