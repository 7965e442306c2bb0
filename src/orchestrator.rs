//! Run orchestration.
//!
//! One image URI is one run. The orchestrator validates every plan before
//! touching the cloud, then drives each image through dispatch, telemetry
//! and cleanup.
//!
//! # Architecture
//!
//! ```text
//!   Environment ──► prepare() ──► Vec<PreparedRun>       (config errors stop here)
//!                                       │
//!                                       ▼ per image
//!                             ResourceLedger (new run id)
//!                                       │
//!                 ┌─────────────────────┴─────────────────────┐
//!                 ▼                                           ▼
//!            Dispatcher ── TestResult ── mpsc ──────► TelemetrySink
//!                 │                                           │
//!        AdapterFactory ──► PlatformAdapter             extract, judge,
//!                 │                                     upload, emit
//!        ResourceProvider ──► ledger.append                   │
//!                 │                                           ▼
//!                 └──────────────► CleanupCoordinator    Vec<TestResult>
//!                                  (reverse ledger walk)      │
//!                                           │                 │
//!                                           └──── RunResult ◄─┘
//!                                                     │
//!                                                     ▼
//!                                                 Reporter
//! ```
//!
//! Dispatch and the sink run concurrently on the same task; the sink is
//! the only consumer of the result channel. Cleanup starts only once the
//! dispatcher has returned, and it runs whether the entries passed, failed
//! or were cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{AdapterContext, AdapterFactory, HttpProbe, ReqwestProbe};
use crate::buildspec::{self, PlanError};
use crate::cleanup::{CleanupCoordinator, CleanupReport};
use crate::cloud::aws::{self, AwsCloud, CloudWatchMetrics, S3Store};
use crate::cloud::kubectl::KubectlCli;
use crate::cloud::{CloudApi, KubeApi, MetricsBackend, ObjectStore};
use crate::config::Config;
use crate::dispatcher::{self, DispatchOptions, Dispatcher, TestResult, TestStatus};
use crate::environment::{EnvError, Environment};
use crate::image::{ImageDescriptor, ImageError};
use crate::ledger::ResourceLedger;
use crate::plan::TestPlan;
use crate::provider::ResourceProvider;
use crate::remote::local::LocalChannel;
use crate::remote::ssh::SshConnector;
use crate::remote::{Connector, RemoteChannel};
use crate::report::{NullReporter, Reporter};
use crate::telemetry::{JsonLinesMetrics, RunContext, TelemetryError, TelemetrySink, ThresholdTable};

/// Exit code for configuration and validation errors.
pub const EXIT_CONFIG_ERROR: i32 = 1;

/// Results buffered between the dispatcher and the sink.
const RESULT_CHANNEL_SIZE: usize = 64;

/// Errors that stop a run before any resource is created.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("{}:\n{source}", path.display())]
    Plan {
        path: PathBuf,
        #[source]
        source: PlanError,
    },

    #[error("No image in {} matches {uri}", path.display())]
    NoImage { uri: String, path: PathBuf },

    #[error("Invalid threshold table: {0}")]
    Thresholds(#[from] TelemetryError),
}

/// One image with its validated plan.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub image: ImageDescriptor,
    /// Key of the matching image in the buildspec.
    pub image_name: String,
    pub buildspec: PathBuf,
    pub plan: TestPlan,
}

/// Parses every image URI and loads its plan.
///
/// Nothing here talks to the cloud, so a bad buildspec fails fast.
pub fn prepare(env: &Environment) -> Result<Vec<PreparedRun>, ConfigError> {
    env.images
        .iter()
        .map(|uri| {
            let image = ImageDescriptor::parse(uri)?;
            let path = env.locate_buildspec(&image)?;
            let plan = buildspec::load(&path, env).map_err(|source| ConfigError::Plan {
                path: path.clone(),
                source,
            })?;
            let image_name = plan
                .image_for(&image)
                .map(|spec| spec.name.clone())
                .ok_or_else(|| ConfigError::NoImage {
                    uri: uri.clone(),
                    path: path.clone(),
                })?;
            Ok(PreparedRun {
                image,
                image_name,
                buildspec: path,
                plan,
            })
        })
        .collect()
}

/// Aggregated results of one image run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every entry passed or was skipped, cleanup was clean |
/// | 2 | At least one entry failed or hit an infrastructure error |
/// | 3 | Entries passed but at least one release failed |
///
/// Code 1 (configuration errors) never reaches a `RunResult`.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The image URI.
    pub image: String,
    pub image_name: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<TestResult>,
    pub cleanup: CleanupReport,
}

impl RunResult {
    fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Fail)
    }

    pub fn infra_errors(&self) -> usize {
        self.count(TestStatus::InfraError)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestStatus::Skip)
    }

    /// No entry failed and cleanup released everything.
    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 || self.infra_errors() > 0 {
            2
        } else if !self.cleanup.is_clean() {
            3
        } else {
            0
        }
    }
}

/// Combines per-image exit codes: a test failure outranks a cleanup error.
pub fn exit_code(runs: &[RunResult]) -> i32 {
    let codes: Vec<i32> = runs.iter().map(RunResult::exit_code).collect();
    if codes.contains(&2) {
        2
    } else if codes.contains(&3) {
        3
    } else {
        0
    }
}

/// Cancels `token` on the first SIGINT or SIGTERM.
///
/// In-flight commands finish and no new entries start; cleanup still runs.
/// The handlers are installed before this returns, so a signal delivered
/// afterwards never takes the default (terminating) action.
#[cfg(unix)]
pub fn cancel_on_shutdown(
    token: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        warn!(signal = name, "Interrupted: skipping remaining entries, cleanup continues");
        token.cancel();
    }))
}

#[cfg(not(unix))]
pub fn cancel_on_shutdown(
    token: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: skipping remaining entries, cleanup continues");
            token.cancel();
        }
    }))
}

/// External collaborators of a run.
#[derive(Clone)]
pub struct Services {
    pub cloud: Arc<dyn CloudApi>,
    pub kube: Arc<dyn KubeApi>,
    /// `None` keeps logs local.
    pub store: Option<Arc<dyn ObjectStore>>,
    pub metrics: Arc<dyn MetricsBackend>,
    pub connector: Arc<dyn Connector>,
    pub local: Arc<dyn RemoteChannel>,
    pub http: Arc<dyn HttpProbe>,
}

impl Services {
    /// AWS SDK clients for `region`, `kubectl`, system `ssh` and local
    /// processes rooted at `repo_root`.
    pub async fn aws(
        config: &Config,
        region: &str,
        repo_root: &Path,
        cancel: CancellationToken,
    ) -> Self {
        let sdk = aws::load_sdk_config(region).await;
        info!(region, "Loaded AWS configuration");

        let store: Option<Arc<dyn ObjectStore>> = config
            .telemetry
            .bucket
            .as_ref()
            .map(|bucket| Arc::new(S3Store::new(&sdk, bucket.clone())) as Arc<dyn ObjectStore>);
        let metrics: Arc<dyn MetricsBackend> = match &config.telemetry.metrics_file {
            Some(path) => Arc::new(JsonLinesMetrics::new(path.clone())),
            None => Arc::new(CloudWatchMetrics::new(&sdk)),
        };

        Self {
            cloud: Arc::new(AwsCloud::new(&sdk)),
            kube: Arc::new(KubectlCli::new()),
            store,
            metrics,
            connector: Arc::new(SshConnector::new(config.remote.clone(), cancel)),
            local: Arc::new(LocalChannel::new(repo_root)),
            http: Arc::new(ReqwestProbe::new()),
        }
    }
}

/// Runs prepared images one after another.
pub struct Orchestrator {
    config: Arc<Config>,
    env: Environment,
    services: Services,
    thresholds: ThresholdTable,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        env: Environment,
        services: Services,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let thresholds = ThresholdTable::new(
            &config.thresholds,
            !config.telemetry.disable_builtin_thresholds,
        )?;
        Ok(Self {
            config: Arc::new(config),
            env,
            services,
            thresholds,
            reporter: Arc::new(NullReporter),
            cancel,
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs every image. Each gets its own ledger and cleanup walk.
    pub async fn run(&self, runs: &[PreparedRun]) -> Vec<RunResult> {
        let mut results = Vec::with_capacity(runs.len());
        for prepared in runs {
            results.push(self.run_image(prepared).await);
        }
        results
    }

    /// dispatch → sink → cleanup for one image.
    pub async fn run_image(&self, prepared: &PreparedRun) -> RunResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = new_run_id();
        let image = &prepared.image;

        info!(
            run = %run_id,
            image = %image,
            buildspec = %prepared.buildspec.display(),
            "Starting run"
        );

        let ledger = Arc::new(ResourceLedger::new(
            run_id.clone(),
            self.services.cloud.region(),
            self.config.orchestrator.tag_prefix.clone(),
        ));
        let provider = Arc::new(ResourceProvider::new(
            self.services.cloud.clone(),
            self.services.kube.clone(),
            ledger.clone(),
            self.config.provider.clone(),
            self.cancel.clone(),
        ));
        let work_dir = std::env::temp_dir().join(format!("dlc-orchestrator-{}", run_id));

        let factory = AdapterFactory::new(AdapterContext {
            provider: provider.clone(),
            connector: self.services.connector.clone(),
            local: self.services.local.clone(),
            http: self.services.http.clone(),
            config: self.config.clone(),
            build_context: self.env.build_context,
            repo_root: self.env.repo_root.clone(),
            work_dir: work_dir.clone(),
        });
        let dispatcher = Dispatcher::new(
            factory,
            DispatchOptions {
                max_parallel: self.config.orchestrator.max_parallel,
                log_dir: self.config.orchestrator.log_dir.clone(),
            },
            self.cancel.clone(),
        )
        .with_reporter(self.reporter.clone());
        let sink = TelemetrySink::new(
            self.config.telemetry.clone(),
            self.services.store.clone(),
            self.services.metrics.clone(),
            self.thresholds.clone(),
            RunContext {
                image: image.clone(),
                build_context: self.env.build_context,
                commit: self.env.commit_id.clone(),
                executor_mode: self.env.executor_mode,
            },
        )
        .with_reporter(self.reporter.clone());

        let entries = dispatcher::select(
            &prepared.plan,
            &prepared.image_name,
            image,
            self.env.test_type,
        )
        .len();
        self.reporter.on_run_start(image, entries).await;

        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let (stats, results) = tokio::join!(
            dispatcher.dispatch(
                &prepared.plan,
                &prepared.image_name,
                image,
                self.env.test_type,
                tx,
            ),
            sink.consume(rx),
        );
        info!(run = %run_id, ran = stats.ran, skipped = stats.skipped, "Dispatch finished");

        let cleanup = CleanupCoordinator::new(
            provider,
            Duration::from_secs(self.config.orchestrator.release_timeout_secs),
        )
        .release_all(&ledger)
        .await;

        if work_dir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&work_dir).await
        {
            warn!(dir = %work_dir.display(), error = %e, "Failed to remove work directory");
        }

        let run = RunResult {
            image: image.uri.clone(),
            image_name: prepared.image_name.clone(),
            run_id,
            started_at,
            duration: started.elapsed(),
            results,
            cleanup,
        };
        info!(
            run = %run.run_id,
            passed = run.passed(),
            failed = run.failed(),
            infra_errors = run.infra_errors(),
            skipped = run.skipped(),
            cleanup = %run.cleanup,
            "Run finished"
        );
        self.reporter.on_run_complete(&run).await;
        run
    }
}

/// 16 hex characters, unique per image run.
fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}
