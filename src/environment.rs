//! Process environment for a run.
//!
//! Everything the orchestrator reads from the process environment is
//! captured once into an [`Environment`] and passed down explicitly.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::image::{Arch, ImageDescriptor};
use crate::plan::PlatformFamily;

/// Errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("DLC_IMAGE lists no testable images")]
    NoImages,

    #[error("no buildspec found for framework '{framework}' under {root}")]
    BuildspecNotFound { framework: String, root: PathBuf },
}

/// Which pipeline triggered the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildContext {
    #[default]
    Pr,
    Mainline,
    Nightly,
}

impl BuildContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildContext::Pr => "PR",
            BuildContext::Mainline => "MAINLINE",
            BuildContext::Nightly => "NIGHTLY",
        }
    }
}

impl FromStr for BuildContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PR" => Ok(BuildContext::Pr),
            "MAINLINE" => Ok(BuildContext::Mainline),
            "NIGHTLY" => Ok(BuildContext::Nightly),
            other => Err(format!("expected PR, MAINLINE or NIGHTLY, got '{}'", other)),
        }
    }
}

impl fmt::Display for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the process environment for one invocation.
#[derive(Debug, Clone)]
pub struct Environment {
    pub test_type: PlatformFamily,
    /// Image URIs to test, one run each.
    pub images: Vec<String>,
    /// When set, run-level metrics are left to the calling executor.
    pub executor_mode: bool,
    pub region: Option<String>,
    pub account_id: Option<String>,
    pub build_context: BuildContext,
    pub buildspec_path: Option<PathBuf>,
    pub commit_id: Option<String>,
    pub repo_root: PathBuf,
    vars: HashMap<String, String>,
}

impl Environment {
    /// Reads the real process environment.
    pub fn from_env(repo_root: PathBuf) -> Result<Self, EnvError> {
        Self::from_vars(std::env::vars(), repo_root)
    }

    /// Builds an environment from explicit variables.
    pub fn from_vars<I, K, V>(vars: I, repo_root: PathBuf) -> Result<Self, EnvError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let raw_type = get("TEST_TYPE").ok_or(EnvError::Missing("TEST_TYPE"))?;
        let test_type = raw_type.parse::<PlatformFamily>().map_err(|reason| EnvError::Invalid {
            name: "TEST_TYPE",
            value: raw_type.clone(),
            reason,
        })?;

        let raw_images = get("DLC_IMAGE").ok_or(EnvError::Missing("DLC_IMAGE"))?;
        let images: Vec<String> = raw_images
            .split_whitespace()
            .filter(|uri| !uri.contains("example"))
            .map(str::to_string)
            .collect();
        if images.is_empty() {
            return Err(EnvError::NoImages);
        }

        let executor_mode = match get("EXECUTOR_MODE") {
            None => false,
            Some(v) => parse_bool(&v).ok_or_else(|| EnvError::Invalid {
                name: "EXECUTOR_MODE",
                value: v.clone(),
                reason: "expected true or false".to_string(),
            })?,
        };

        let build_context = match get("BUILD_CONTEXT") {
            None => BuildContext::default(),
            Some(v) => v.parse::<BuildContext>().map_err(|reason| EnvError::Invalid {
                name: "BUILD_CONTEXT",
                value: v.clone(),
                reason,
            })?,
        };

        Ok(Self {
            test_type,
            images,
            executor_mode,
            region: get("REGION"),
            account_id: get("ACCOUNT_ID"),
            build_context,
            buildspec_path: get("BUILDSPEC_PATH").map(PathBuf::from),
            commit_id: get("CODEBUILD_RESOLVED_SOURCE_VERSION"),
            repo_root,
            vars,
        })
    }

    /// Looks up any captured variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        match name {
            "REGION" => self.region.as_deref(),
            "ACCOUNT_ID" => self.account_id.as_deref(),
            _ => self.vars.get(name).map(String::as_str).filter(|v| !v.is_empty()),
        }
    }

    /// Locates the buildspec that describes `image`.
    ///
    /// Order: `BUILDSPEC_PATH`, `<root>/<framework>/buildspec-arm64.yml` for
    /// ARM images, `<root>/<framework>/buildspec.yml`, `<root>/buildspec.yml`.
    pub fn locate_buildspec(&self, image: &ImageDescriptor) -> Result<PathBuf, EnvError> {
        if let Some(path) = &self.buildspec_path {
            return Ok(if path.is_absolute() {
                path.clone()
            } else {
                self.repo_root.join(path)
            });
        }

        let framework_dir = self.repo_root.join(&image.framework);
        let mut candidates = Vec::new();
        if image.arch.is_arm() {
            candidates.push(framework_dir.join(format!("buildspec-{}.yml", Arch::Arm64)));
        }
        candidates.push(framework_dir.join("buildspec.yml"));
        candidates.push(self.repo_root.join("buildspec.yml"));

        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| EnvError::BuildspecNotFound {
                framework: image.framework.clone(),
                root: self.repo_root.clone(),
            })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Finds the repository root: the nearest ancestor holding `.git`.
pub fn find_repo_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .unwrap_or(start)
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> Result<Environment, EnvError> {
        Environment::from_vars(vars.iter().copied(), PathBuf::from("/repo"))
    }

    #[test]
    fn test_reads_required_variables() {
        let env = env(&[
            ("TEST_TYPE", "vm"),
            ("DLC_IMAGE", "a:1.0-cpu-py3-al2  b:1.0-gpu-py3-al2"),
            ("EXECUTOR_MODE", "True"),
            ("REGION", "us-west-2"),
            ("BUILD_CONTEXT", "nightly"),
        ])
        .unwrap();

        assert_eq!(env.test_type, PlatformFamily::Vm);
        assert_eq!(env.images, vec!["a:1.0-cpu-py3-al2", "b:1.0-gpu-py3-al2"]);
        assert!(env.executor_mode);
        assert_eq!(env.var("REGION"), Some("us-west-2"));
        assert_eq!(env.var("ACCOUNT_ID"), None);
        assert_eq!(env.build_context, BuildContext::Nightly);
    }

    #[test]
    fn test_example_images_are_dropped() {
        let err = env(&[
            ("TEST_TYPE", "kubernetes"),
            ("DLC_IMAGE", "pytorch-training-example:2.0-gpu-py3-al2"),
        ])
        .unwrap_err();
        assert!(matches!(err, EnvError::NoImages));
    }

    #[test]
    fn test_missing_and_invalid_variables() {
        assert!(matches!(
            env(&[("DLC_IMAGE", "a:1")]).unwrap_err(),
            EnvError::Missing("TEST_TYPE")
        ));
        assert!(matches!(
            env(&[("TEST_TYPE", "lambda"), ("DLC_IMAGE", "a:1")]).unwrap_err(),
            EnvError::Invalid { name: "TEST_TYPE", .. }
        ));
        assert!(matches!(
            env(&[
                ("TEST_TYPE", "vm"),
                ("DLC_IMAGE", "a:1"),
                ("BUILD_CONTEXT", "RELEASE")
            ])
            .unwrap_err(),
            EnvError::Invalid { name: "BUILD_CONTEXT", .. }
        ));
    }

    #[test]
    fn test_locate_buildspec_prefers_arm_file() {
        let dir = TempDir::new().unwrap();
        let framework_dir = dir.path().join("pytorch");
        std::fs::create_dir_all(&framework_dir).unwrap();
        std::fs::write(framework_dir.join("buildspec.yml"), "").unwrap();
        std::fs::write(framework_dir.join("buildspec-arm64.yml"), "").unwrap();

        let env = Environment::from_vars(
            [("TEST_TYPE", "vm"), ("DLC_IMAGE", "x:1")],
            dir.path().to_path_buf(),
        )
        .unwrap();

        let arm = ImageDescriptor::parse("pytorch-training-arm64:2.6.0-gpu-py312-ubuntu22.04").unwrap();
        let x86 = ImageDescriptor::parse("pytorch-training:2.6.0-gpu-py312-ubuntu22.04").unwrap();
        let tf = ImageDescriptor::parse("tensorflow-training:2.16.0-gpu-py312-ubuntu22.04").unwrap();

        assert_eq!(
            env.locate_buildspec(&arm).unwrap(),
            framework_dir.join("buildspec-arm64.yml")
        );
        assert_eq!(
            env.locate_buildspec(&x86).unwrap(),
            framework_dir.join("buildspec.yml")
        );
        assert!(env.locate_buildspec(&tf).is_err());
    }

    #[test]
    fn test_find_repo_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested), dir.path());
    }
}
