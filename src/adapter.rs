//! Platform adapters.
//!
//! An adapter realises one [`TestEntry`] on one platform family. It is
//! created fresh for every entry, driven through
//! `setup → execute_command* → teardown` by the dispatcher, and dropped
//! afterwards. Adapters acquire resources only through the
//! [`ResourceProvider`], so everything they create lands in the ledger and
//! is released by the cleanup coordinator; `teardown` only closes what the
//! adapter itself holds open (channels, containers, kubeconfig files).

pub mod ecs;
pub mod kube;
pub mod state;
pub mod vm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;
use crate::environment::BuildContext;
use crate::image::ImageDescriptor;
use crate::ledger::ResourceRef;
use crate::plan::{Params, PlatformFamily, TestEntry};
use crate::provider::{ProvisionError, ResourceProvider};
use crate::remote::{Connector, ExecResult, RemoteChannel, RemoteError};
use crate::waiter::WaitError;
pub use state::{AdapterState, InvalidTransition, Lifecycle};

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by adapters, already shaped for the failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A service or pod never became ready.
    #[error("Health check timed out after {}s waiting for {what}", waited.as_secs())]
    HealthCheckTimeout { what: String, waited: Duration },

    /// An entry parameter is missing or unusable at setup time.
    #[error("Invalid param '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Failed to render manifest '{path}': {reason}")]
    Manifest { path: String, reason: String },

    #[error("Adapter {0}")]
    State(#[from] InvalidTransition),

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn invalid_param(name: &str, reason: impl Into<String>) -> Self {
        AdapterError::InvalidParam {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Where this error sits in the user-visible taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Provision(ProvisionError::CapacityUnavailable { .. }) => {
                FailureKind::CapacityUnavailable
            }
            AdapterError::Provision(ProvisionError::ProvisionTimeout { .. }) => {
                FailureKind::ProvisionTimeout
            }
            AdapterError::Provision(ProvisionError::Cancelled(_)) | AdapterError::Cancelled(_) => {
                FailureKind::Cancelled
            }
            AdapterError::Provision(_) => FailureKind::Infrastructure,
            AdapterError::Remote(RemoteError::CommandFailed { .. })
            | AdapterError::Remote(RemoteError::Timeout { .. }) => FailureKind::RemoteCommandFailed,
            AdapterError::Remote(RemoteError::Cancelled(_)) => FailureKind::Cancelled,
            AdapterError::Remote(_) => FailureKind::Infrastructure,
            AdapterError::HealthCheckTimeout { .. } => FailureKind::HealthCheckTimeout,
            AdapterError::InvalidParam { .. } | AdapterError::Manifest { .. } => {
                FailureKind::Config
            }
            AdapterError::State(_) | AdapterError::Io(_) => FailureKind::Infrastructure,
        }
    }
}

/// Converts a readiness wait into a health-check failure.
pub(crate) fn health_wait<E>(err: WaitError<E>) -> AdapterError
where
    E: Into<AdapterError>,
{
    match err {
        WaitError::Timeout { what, waited } => AdapterError::HealthCheckTimeout { what, waited },
        WaitError::Cancelled { what } => AdapterError::Cancelled(format!("waiting for {}", what)),
        WaitError::Failed(e) => e.into(),
    }
}

/// Whether an adapter can keep running commands after `result`. A timed
/// out command leaves the target usable; a lost channel does not.
pub(crate) fn recoverable<T>(result: &AdapterResult<T>) -> bool {
    matches!(
        result,
        Ok(_) | Err(AdapterError::Remote(RemoteError::Timeout { .. }))
    )
}

/// User-visible failure taxonomy recorded on every non-pass result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Invalid buildspec, params or environment.
    Config,
    CapacityUnavailable,
    ProvisionTimeout,
    /// Any other provisioning or connectivity failure.
    Infrastructure,
    RemoteCommandFailed,
    HealthCheckTimeout,
    ThresholdBreach,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Config => "ConfigError",
            FailureKind::CapacityUnavailable => "CapacityUnavailable",
            FailureKind::ProvisionTimeout => "ProvisionTimeout",
            FailureKind::Infrastructure => "InfrastructureError",
            FailureKind::RemoteCommandFailed => "RemoteCommandFailed",
            FailureKind::HealthCheckTimeout => "HealthCheckTimeout",
            FailureKind::ThresholdBreach => "ThresholdBreach",
            FailureKind::Cancelled => "Cancelled",
        }
    }

    /// Failures of the platform rather than of the code under test.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailureKind::Config
                | FailureKind::CapacityUnavailable
                | FailureKind::ProvisionTimeout
                | FailureKind::Infrastructure
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What setup produced: weak references plus where to reach it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    pub resources: Vec<ResourceRef>,
    /// Addresses of the hosts commands run on.
    pub hosts: Vec<String>,
    /// Service endpoint, for serving entries.
    pub endpoint: Option<String>,
}

/// One platform family's realisation of a test entry.
#[async_trait]
pub trait PlatformAdapter: Send {
    fn family(&self) -> PlatformFamily;

    fn state(&self) -> AdapterState;

    /// Acquires and prepares everything the entry's commands need.
    async fn setup(&mut self, params: &Params) -> AdapterResult<ResourceSet>;

    /// Runs one command of the entry. A non-zero exit code is a result, not
    /// an error.
    async fn execute_command(&mut self, command: &str) -> AdapterResult<ExecResult>;

    /// Releases what the adapter holds open. Always leaves TORN_DOWN.
    async fn teardown(&mut self) -> AdapterResult<()>;
}

/// One HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends HTTP requests to served models.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpReply, String>;
}

/// [`HttpProbe`] over `reqwest`.
#[derive(Default)]
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpReply, String> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| e.to_string())?;
        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_string());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(HttpReply { status, body })
    }
}

/// Everything an adapter needs besides its entry.
#[derive(Clone)]
pub struct AdapterContext {
    pub provider: Arc<ResourceProvider>,
    pub connector: Arc<dyn Connector>,
    /// Runs commands on the orchestrator host (`kubectl`, helper scripts).
    pub local: Arc<dyn RemoteChannel>,
    pub http: Arc<dyn HttpProbe>,
    pub config: Arc<Config>,
    pub build_context: BuildContext,
    pub repo_root: PathBuf,
    /// Scratch space for kubeconfigs and staged files.
    pub work_dir: PathBuf,
}

impl AdapterContext {
    /// Timeout for one entry command.
    pub fn command_timeout(&self, params: &Params) -> u64 {
        params
            .u64("timeout_secs")
            .unwrap_or(self.config.remote.command_timeout_secs)
    }

    /// Variables exported to every command of an entry.
    pub fn command_env(&self, params: &Params) -> Vec<(String, String)> {
        let mut env = vec![("BUILD_CONTEXT".to_string(), self.build_context.to_string())];
        for (var, key) in [
            ("AWS_REGION", "region"),
            ("DLC_IMAGE", "image_uri"),
            ("ARCH_TYPE", "arch_type"),
            ("FRAMEWORK", "framework"),
        ] {
            if let Some(value) = params.render(key) {
                env.push((var.to_string(), value));
            }
        }
        env.extend(params.string_map("env"));
        env
    }
}

/// Builds the adapter for an entry's platform family.
#[derive(Clone)]
pub struct AdapterFactory {
    ctx: AdapterContext,
}

impl AdapterFactory {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    pub fn create(&self, entry: &TestEntry, image: &ImageDescriptor) -> Box<dyn PlatformAdapter> {
        let ctx = self.ctx.clone();
        match entry.platform.family {
            PlatformFamily::Vm => Box::new(vm::VmAdapter::new(ctx, entry.clone(), image.clone())),
            PlatformFamily::ContainerCluster => {
                Box::new(ecs::EcsAdapter::new(ctx, entry.clone(), image.clone()))
            }
            PlatformFamily::Kubernetes => {
                Box::new(kube::KubeAdapter::new(ctx, entry.clone(), image.clone()))
            }
        }
    }
}

/// Splits a `METHOD PATH [BODY]` probe command.
pub(crate) fn parse_probe(command: &str) -> Option<(String, String, Option<String>)> {
    let command = command.trim();
    let (method, rest) = command.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    let (path, body) = match rest.split_once(char::is_whitespace) {
        Some((path, body)) => (path, Some(body.trim().to_string())),
        None => (rest, None),
    };
    let method = method.to_ascii_uppercase();
    let known = ["GET", "POST", "PUT", "DELETE", "HEAD"];
    (known.contains(&method.as_str()) && path.starts_with('/'))
        .then(|| (method, path.to_string(), body.filter(|b| !b.is_empty())))
}
