//! Image URI parsing.
//!
//! Every image under test is identified by a registry URI whose tag encodes
//! the build matrix coordinates:
//!
//! ```text
//! <registry>/<repository>:<framework_version>-<processor>[-<cuda>]-<python>-<os>[-<extras>]
//! ```
//!
//! For example `763104351884.dkr.ecr.us-west-2.amazonaws.com/pytorch-training:2.6.0-gpu-cu124-py312-ubuntu22.04-ec2`
//! parses into framework `pytorch`, job type `training`, version `2.6.0`,
//! processor `gpu`, CUDA `cu124`, python `py312`, OS `ubuntu22.04` and the
//! extra token `ec2`.
//!
//! The repository name supplies the fields the tag does not carry: the
//! framework, the job type, the architecture and an optional contributor
//! prefix (`huggingface-pytorch-inference`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Repository prefixes that name a contributor rather than a framework.
const CONTRIBUTORS: &[&str] = &["huggingface", "autogluon", "stabilityai", "trcomp"];

/// Frameworks whose images serve models even without an `inference` token.
const SERVING_FRAMEWORKS: &[&str] = &["vllm", "sglang", "tgi"];

/// Errors produced while parsing an image URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// The URI has no `:<tag>` suffix.
    #[error("image URI '{0}' has no tag")]
    MissingTag(String),

    /// The URI has no repository path.
    #[error("image URI '{0}' has no repository")]
    MissingRepository(String),

    /// The tag does not follow the `<version>-<processor>-...` grammar.
    #[error("invalid image tag '{tag}': {reason}")]
    InvalidTag {
        /// The offending tag.
        tag: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Compute accelerator class an image is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    Cpu,
    Gpu,
    Neuron,
    Eia,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Cpu => "cpu",
            Processor::Gpu => "gpu",
            Processor::Neuron => "neuron",
            Processor::Eia => "eia",
        }
    }
}

impl FromStr for Processor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Processor::Cpu),
            "gpu" => Ok(Processor::Gpu),
            "neuron" | "neuronx" | "inf" => Ok(Processor::Neuron),
            "eia" => Ok(Processor::Eia),
            other => Err(format!("unknown processor '{}'", other)),
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    X86,
    Arm64,
    Graviton,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::Arm64 => "arm64",
            Arch::Graviton => "graviton",
        }
    }

    /// Returns true for the ARM-based architectures.
    pub fn is_arm(&self) -> bool {
        matches!(self, Arch::Arm64 | Arch::Graviton)
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86" | "x86_64" | "amd64" => Ok(Arch::X86),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "graviton" => Ok(Arch::Graviton),
            other => Err(format!("unknown architecture '{}'", other)),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an image trains models or serves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Training,
    Inference,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Training => "training",
            JobType::Inference => "inference",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields encoded in an image tag.
///
/// Formatting then parsing gives the value back when no field contains a
/// `-`; an extra such as `"a-b"` comes back as two extras. Parsing is not
/// the inverse of formatting either: the `neuronx` and `inf` aliases parse
/// to [`Processor::Neuron`] and format as `neuron`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageTag {
    pub framework_version: String,
    pub processor: Processor,
    pub cuda_version: Option<String>,
    pub python_version: String,
    pub os_version: String,
    pub extras: Vec<String>,
}

impl ImageTag {
    /// Parses a tag such as `2.6.0-gpu-cu124-py312-ubuntu22.04-ec2`.
    ///
    /// The CUDA and python tokens may appear in either order after the
    /// processor; the first token that is neither is the OS version and
    /// everything after it is kept as extras.
    ///
    /// ```
    /// use dlc_orchestrator::image::{ImageTag, Processor};
    ///
    /// let tag = ImageTag::parse("2.6.0-gpu-cu124-py312-ubuntu22.04-ec2").unwrap();
    /// assert_eq!(tag.framework_version, "2.6.0");
    /// assert_eq!(tag.processor, Processor::Gpu);
    /// assert_eq!(tag.cuda_version.as_deref(), Some("cu124"));
    /// assert_eq!(tag.extras, vec!["ec2".to_string()]);
    /// ```
    pub fn parse(tag: &str) -> Result<Self, ImageError> {
        let invalid = |reason: &str| ImageError::InvalidTag {
            tag: tag.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens = tag.split('-');

        let framework_version = tokens
            .next()
            .filter(|v| v.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| invalid("tag must start with the framework version"))?
            .to_string();

        let processor = tokens
            .next()
            .ok_or_else(|| invalid("missing processor"))?
            .parse::<Processor>()
            .map_err(|e| invalid(&e))?;

        let mut cuda_version = None;
        let mut python_version = None;
        let mut os_version = None;

        for token in tokens.by_ref() {
            if is_cuda_token(token) && cuda_version.is_none() {
                cuda_version = Some(token.to_string());
            } else if is_python_token(token) && python_version.is_none() {
                python_version = Some(token.to_string());
            } else {
                os_version = Some(token.to_string());
                break;
            }
        }

        let python_version = python_version.ok_or_else(|| invalid("missing python version"))?;
        let os_version = os_version.ok_or_else(|| invalid("missing OS version"))?;
        let extras = tokens.map(str::to_string).collect();

        Ok(Self {
            framework_version,
            processor,
            cuda_version,
            python_version,
            os_version,
            extras,
        })
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.framework_version, self.processor)?;
        if let Some(cuda) = &self.cuda_version {
            write!(f, "-{}", cuda)?;
        }
        write!(f, "-{}-{}", self.python_version, self.os_version)?;
        for extra in &self.extras {
            write!(f, "-{}", extra)?;
        }
        Ok(())
    }
}

fn is_cuda_token(token: &str) -> bool {
    token
        .strip_prefix("cu")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn is_python_token(token: &str) -> bool {
    token
        .strip_prefix("py")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Everything the orchestrator knows about one image under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    /// The full URI as given.
    pub uri: String,
    /// Registry host, when the URI carries one.
    pub registry: Option<String>,
    /// Repository path without registry and tag.
    pub repository: String,
    pub framework: String,
    pub contributor: Option<String>,
    pub job_type: JobType,
    pub arch: Arch,
    pub tag: ImageTag,
}

impl ImageDescriptor {
    /// Parses a full image URI.
    pub fn parse(uri: &str) -> Result<Self, ImageError> {
        let uri = uri.trim();
        let last_slash = uri.rfind('/').map(|i| i + 1).unwrap_or(0);
        let colon = uri[last_slash..]
            .rfind(':')
            .map(|i| i + last_slash)
            .ok_or_else(|| ImageError::MissingTag(uri.to_string()))?;

        let (path, tag) = (&uri[..colon], &uri[colon + 1..]);
        if tag.is_empty() {
            return Err(ImageError::MissingTag(uri.to_string()));
        }

        let (registry, repository) = match path.split_once('/') {
            Some((host, rest)) if looks_like_registry(host) => (Some(host.to_string()), rest),
            _ => (None, path),
        };
        if repository.is_empty() {
            return Err(ImageError::MissingRepository(uri.to_string()));
        }

        let tag = ImageTag::parse(tag)?;
        let name = repository.rsplit('/').next().unwrap_or(repository);
        let (framework, contributor, job_type, arch) = parse_repository_name(name);

        Ok(Self {
            uri: uri.to_string(),
            registry,
            repository: repository.to_string(),
            framework,
            contributor,
            job_type,
            arch,
            tag,
        })
    }

    pub fn processor(&self) -> Processor {
        self.tag.processor
    }

    pub fn framework_version(&self) -> &str {
        &self.tag.framework_version
    }

    pub fn python_version(&self) -> &str {
        &self.tag.python_version
    }

    /// The framework version as a semver value, padding missing components.
    pub fn semver(&self) -> Option<semver::Version> {
        lenient_version(&self.tag.framework_version)
    }

    /// Short name used in log file names: the last repository segment.
    pub fn name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// The registry account id, when the registry is an ECR host.
    pub fn registry_account(&self) -> Option<&str> {
        let host = self.registry.as_deref()?;
        let account = host.split('.').next()?;
        account
            .chars()
            .all(|c| c.is_ascii_digit())
            .then_some(account)
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Parses `2.6`, `2.6.0` or `2.6.0.post1` into a semver version.
pub fn lenient_version(raw: &str) -> Option<semver::Version> {
    let numeric: Vec<&str> = raw
        .split('.')
        .take_while(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .take(3)
        .collect();
    if numeric.is_empty() {
        return None;
    }
    let mut parts = numeric.iter().map(|p| p.parse::<u64>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(semver::Version::new(major, minor, patch))
}

fn looks_like_registry(host: &str) -> bool {
    host.contains('.') || host.contains(':') || host == "localhost"
}

fn parse_repository_name(name: &str) -> (String, Option<String>, JobType, Arch) {
    let tokens: Vec<&str> = name.split('-').collect();

    let (contributor, rest) = match tokens.split_first() {
        Some((first, rest)) if CONTRIBUTORS.contains(first) && !rest.is_empty() => {
            (Some(first.to_string()), rest)
        }
        _ => (None, tokens.as_slice()),
    };

    let framework = rest.first().copied().unwrap_or(name).to_string();

    let job_type = if rest.contains(&"inference") {
        JobType::Inference
    } else if rest.contains(&"training") {
        JobType::Training
    } else if SERVING_FRAMEWORKS.contains(&framework.as_str()) {
        JobType::Inference
    } else {
        JobType::Training
    };

    let arch = if rest.contains(&"graviton") {
        Arch::Graviton
    } else if rest.contains(&"arm64") {
        Arch::Arm64
    } else {
        Arch::X86
    };

    (framework, contributor, job_type, arch)
}
