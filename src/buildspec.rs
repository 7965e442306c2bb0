//! Buildspec loading.
//!
//! A buildspec is the YAML manifest that declares the images of a framework
//! and the tests each image must pass. Loading happens in three steps:
//!
//! 1. **Substitute** `<set-$NAME-in-environment>` placeholders with values from
//!    the process environment. A variable only has to exist when the file
//!    references it.
//! 2. **Normalize** every `images.<name>.tests[i]` row into a [`TestEntry`],
//!    keeping declaration order.
//! 3. **Validate** the entries with the per-platform rules in [`validate`].
//!
//! All problems found in steps 2 and 3 are reported together as one
//! [`PlanError::Invalid`].
//!
//! ```text
//! framework: pytorch
//! region: <set-$REGION-in-environment>
//! account_id: <set-$ACCOUNT_ID-in-environment>
//! arch_type: x86
//! images:
//!   training_gpu:
//!     repository: <set-$ACCOUNT_ID-in-environment>.dkr.ecr.<set-$REGION-in-environment>.amazonaws.com/pytorch-training
//!     device_type: gpu
//!     tests:
//!       - platform: vm-gpu
//!         params: {instance_type: p4d.24xlarge, node_count: 1}
//!         run: ["python test/vm/smoke.py"]
//! ```

pub mod template;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use crate::environment::Environment;
use crate::image::{Arch, JobType, Processor};
use crate::plan::{
    DataSource, GlobalContext, ImageSpec, Params, Platform, Selectors, TestEntry, TestPlan,
};

/// Result type for buildspec loading.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors that make a buildspec unusable.
///
/// Every variant is a configuration error: the run stops before any cloud
/// resource is created.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The buildspec file could not be read.
    #[error("Failed to read buildspec {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file references environment variables that are not set.
    #[error("Buildspec references unset environment variable(s): {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// The file is not valid YAML or has the wrong shape.
    #[error("Failed to parse buildspec: {0}")]
    Parse(String),

    /// One or more tests failed validation.
    #[error("{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<set-\$([A-Z_][A-Z0-9_]*)-in-environment>").expect("valid placeholder pattern")
});

/// Replaces every `<set-$NAME-in-environment>` with `lookup(NAME)`.
pub fn substitute<F>(text: &str, lookup: F) -> PlanResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let replaced = PLACEHOLDER.replace_all(text, |caps: &Captures| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            String::new()
        })
    });

    if missing.is_empty() {
        Ok(replaced.into_owned())
    } else {
        Err(PlanError::MissingVariables(missing))
    }
}

#[derive(Debug, Deserialize)]
struct RawBuildspec {
    framework: String,
    #[serde(default)]
    region: Option<YamlValue>,
    #[serde(default)]
    account_id: Option<YamlValue>,
    #[serde(default)]
    arch_type: Option<String>,
    #[serde(default)]
    images: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    repository: String,
    #[serde(default)]
    tag: Option<YamlValue>,
    #[serde(default)]
    docker_file: Option<String>,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    python_version: Option<String>,
    #[serde(default)]
    tests: Vec<RawTest>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    platform: String,
    #[serde(default)]
    params: Params,
    #[serde(default)]
    run: Vec<String>,
    #[serde(default)]
    data_source: Option<String>,
    #[serde(default)]
    selectors: RawSelectors,
    #[serde(default)]
    parallel_group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSelectors {
    #[serde(default)]
    framework_version: Option<String>,
    #[serde(default)]
    processor: Vec<String>,
    #[serde(default)]
    arch: Vec<String>,
    #[serde(default)]
    job_type: Vec<String>,
}

impl RawSelectors {
    fn resolve(self) -> Result<Selectors, String> {
        let framework_version = self
            .framework_version
            .map(|req| {
                semver::VersionReq::parse(&req)
                    .map_err(|e| format!("invalid framework_version selector '{}': {}", req, e))
            })
            .transpose()?;

        let processor = self
            .processor
            .iter()
            .map(|p| p.parse::<Processor>())
            .collect::<Result<Vec<_>, _>>()?;
        let arch = self
            .arch
            .iter()
            .map(|a| a.parse::<Arch>())
            .collect::<Result<Vec<_>, _>>()?;
        let job_type = self
            .job_type
            .iter()
            .map(|j| match j.as_str() {
                "training" => Ok(JobType::Training),
                "inference" => Ok(JobType::Inference),
                other => Err(format!("unknown job_type '{}'", other)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Selectors {
            framework_version,
            processor,
            arch,
            job_type,
        })
    }
}

/// Loads and validates the buildspec at `path`.
pub fn load(path: &Path, env: &Environment) -> PlanResult<TestPlan> {
    let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Loaded buildspec from {}", path.display());
    parse(&text, |name| env.var(name).map(str::to_string), &env.repo_root)
}

/// Parses buildspec text into a validated plan.
///
/// `repo_root` anchors the relative paths the validators check.
pub fn parse<F>(text: &str, lookup: F, repo_root: &Path) -> PlanResult<TestPlan>
where
    F: Fn(&str) -> Option<String>,
{
    let text = substitute(text, lookup)?;
    let raw: RawBuildspec =
        serde_yaml::from_str(&text).map_err(|e| PlanError::Parse(e.to_string()))?;

    let mut errors = Vec::new();

    let arch_type = match raw.arch_type.as_deref() {
        None => Arch::default(),
        Some(a) => a.parse::<Arch>().unwrap_or_else(|e| {
            errors.push(e);
            Arch::default()
        }),
    };
    let globals = GlobalContext {
        framework: raw.framework,
        region: raw.region.as_ref().and_then(yaml_scalar).unwrap_or_default(),
        account_id: raw.account_id.as_ref().and_then(yaml_scalar).unwrap_or_default(),
        arch_type,
    };

    let mut images = Vec::new();
    let mut entries = Vec::new();

    for (key, value) in raw.images {
        let Some(name) = yaml_scalar(&key) else {
            return Err(PlanError::Parse("image names must be strings".to_string()));
        };
        // Images without a repository are build-only anchors.
        if value.get("repository").is_none() {
            continue;
        }
        let image: RawImage = serde_yaml::from_value(value)
            .map_err(|e| PlanError::Parse(format!("image '{}': {}", name, e)))?;

        let device_type = image
            .device_type
            .as_deref()
            .map(|d| d.parse::<Processor>())
            .transpose()
            .unwrap_or_else(|e| {
                errors.push(format!("Image {}: {}", name, e));
                None
            });

        for (index, test) in image.tests.into_iter().enumerate() {
            if let Some(entry) = normalize_test(&name, index, test, &mut errors) {
                entries.push(entry);
            }
        }

        images.push(ImageSpec {
            name,
            repository: image.repository,
            tag: image.tag.as_ref().and_then(yaml_scalar),
            docker_file: image.docker_file,
            device_type,
            python_version: image.python_version,
        });
    }

    errors.extend(validate::validate_entries(&entries, repo_root));
    if !errors.is_empty() {
        return Err(PlanError::Invalid(errors));
    }

    tracing::info!(
        "Buildspec for {} declares {} image(s) and {} test(s)",
        globals.framework,
        images.len(),
        entries.len()
    );

    Ok(TestPlan {
        globals,
        images,
        entries,
    })
}

fn normalize_test(
    image_name: &str,
    index: usize,
    test: RawTest,
    errors: &mut Vec<String>,
) -> Option<TestEntry> {
    let Some(platform) = Platform::parse(&test.platform) else {
        errors.push(format!("Test {}: unknown platform", test.platform));
        return None;
    };

    let data_source = match test.data_source.as_deref().map(str::parse::<DataSource>) {
        None => None,
        Some(Ok(source)) => Some(source),
        Some(Err(e)) => {
            errors.push(format!("Test {}: {}", platform, e));
            None
        }
    };

    let selectors = test.selectors.resolve().unwrap_or_else(|e| {
        errors.push(format!("Test {}: {}", platform, e));
        Selectors::default()
    });

    let parallel_group = test
        .parallel_group
        .or_else(|| test.params.str("parallel_group").map(str::to_string));

    Some(TestEntry {
        id: format!("{}/{}-{}", image_name, index, platform),
        image_name: image_name.to_string(),
        index,
        platform,
        params: test.params,
        run: test.run,
        data_source,
        selectors,
        parallel_group,
    })
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlatformFamily;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BUILDSPEC: &str = r#"
framework: pytorch
region: <set-$REGION-in-environment>
account_id: <set-$ACCOUNT_ID-in-environment>
arch_type: x86
images:
  build_only: &BUILD
    build: true
  training_gpu:
    repository: <set-$ACCOUNT_ID-in-environment>.dkr.ecr.<set-$REGION-in-environment>.amazonaws.com/pytorch-training
    tag: 2.6.0-gpu-py312
    device_type: gpu
    python_version: py312
    tests:
      - platform: vm-gpu
        params: {instance_type: p4d.24xlarge, node_count: 1}
        run: ["python -c 'import torch'"]
      - platform: kube-gpu
        params: {cluster: dlc-pr, namespace: vllm, node_count: 2}
        run: ["kubectl get pods"]
        selectors:
          framework_version: ">=2.5"
          processor: [gpu]
  training_cpu:
    repository: pytorch-training
    tests:
      - platform: ecs-cpu
        params: {instance_type: c5.4xlarge}
        run: ["GET /ping"]
        data_source: throughput
        parallel_group: bench
"#;

    #[test]
    fn test_substitute_reports_missing_variables() {
        let text = "a: <set-$REGION-in-environment>\nb: <set-$ACCOUNT_ID-in-environment>";
        assert_eq!(
            substitute(text, vars(&[("REGION", "us-west-2"), ("ACCOUNT_ID", "1")])).unwrap(),
            "a: us-west-2\nb: 1"
        );
        match substitute(text, vars(&[])) {
            Err(PlanError::MissingVariables(names)) => {
                assert_eq!(names, vec!["REGION", "ACCOUNT_ID"])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(substitute("plain", vars(&[])).unwrap(), "plain");
    }

    #[test]
    fn test_parse_preserves_order_and_globals() {
        let plan = parse(
            BUILDSPEC,
            vars(&[("REGION", "us-west-2"), ("ACCOUNT_ID", "123456789012")]),
            Path::new("/"),
        )
        .unwrap();

        assert_eq!(plan.globals.region, "us-west-2");
        assert_eq!(plan.globals.account_id, "123456789012");
        assert_eq!(plan.images.len(), 2);
        assert_eq!(plan.images[0].name, "training_gpu");
        assert_eq!(plan.images[0].device_type, Some(Processor::Gpu));
        assert_eq!(
            plan.images[0].repository,
            "123456789012.dkr.ecr.us-west-2.amazonaws.com/pytorch-training"
        );

        let ids: Vec<&str> = plan.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "training_gpu/0-vm-gpu",
                "training_gpu/1-kube-gpu",
                "training_cpu/0-ecs-cpu"
            ]
        );
        assert_eq!(plan.entries[1].platform.family, PlatformFamily::Kubernetes);
        assert!(plan.entries[1].selectors.framework_version.is_some());
        assert_eq!(plan.entries[2].data_source, Some(DataSource::Throughput));
        assert_eq!(plan.entries[2].parallel_group.as_deref(), Some("bench"));
    }

    #[test]
    fn test_validation_errors_are_aggregated() {
        let text = r#"
framework: pytorch
images:
  img:
    repository: pytorch-training
    tests:
      - platform: vm-gpu
        params: {}
        run: ["true"]
      - platform: lambda-cpu
        run: ["true"]
      - platform: kube-gpu
        params: {cluster: dlc-pr, namespace: ns}
        run: ["true"]
        data_source: bandwidth
"#;
        let err = parse(text, vars(&[]), Path::new("/")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Test vm-gpu: missing required param 'instance_type'"));
        assert!(message.contains("Test lambda-cpu: unknown platform"));
        assert!(message.contains("Test kube-gpu: unknown data_source 'bandwidth'"));
        assert_eq!(message.lines().count(), 3);
    }

    #[test]
    fn test_unreferenced_variables_not_required() {
        let text = "framework: tensorflow\nregion: us-east-1\nimages: {}\n";
        let plan = parse(text, vars(&[]), Path::new("/")).unwrap();
        assert_eq!(plan.globals.region, "us-east-1");
        assert!(plan.entries.is_empty());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("buildspec.yml");
        std::fs::write(&path, "framework: mxnet\nimages: {}\n").unwrap();

        let env = Environment::from_vars(
            [("TEST_TYPE", "vm"), ("DLC_IMAGE", "mxnet-training:1.9-cpu-py38-ubuntu20.04")],
            dir.path().to_path_buf(),
        )
        .unwrap();
        assert_eq!(load(&path, &env).unwrap().globals.framework, "mxnet");
        assert!(matches!(
            load(&dir.path().join("absent.yml"), &env),
            Err(PlanError::Read { .. })
        ));
    }
}
