//! dlc-orchestrator: multi-platform test orchestration for Deep Learning
//! Container images.
//!
//! A buildspec declares, per image, a matrix of test entries. Each entry
//! names a platform (plain VMs, a container cluster or Kubernetes), the
//! parameters that platform needs and the shell commands that make up the
//! test. The orchestrator provisions what each entry needs, runs its
//! commands, judges the output against benchmark thresholds and releases
//! every resource it created, in reverse creation order, no matter how the
//! run ended.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Buildspec** ([`buildspec`]): load, substitute and validate the manifest into a [`plan::TestPlan`]
//! - **Provider** ([`provider`]): acquire and release cloud resources, recording each in the [`ledger`]
//! - **Remote** ([`remote`]): run commands on hosts over `ssh` or locally
//! - **Adapters** ([`adapter`]): per-platform `setup → execute → teardown`
//! - **Dispatcher** ([`dispatcher`]): select entries and run them serially or in parallel groups
//! - **Telemetry** ([`telemetry`]): extract benchmark numbers, check thresholds, upload logs, emit metrics
//! - **Cleanup** ([`cleanup`]): reverse ledger walk and stale-resource janitor
//! - **Report** ([`report`]): console and JUnit XML output
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use dlc_orchestrator::config::load_config_or_default;
//! use dlc_orchestrator::environment::Environment;
//! use dlc_orchestrator::orchestrator::{self, Orchestrator, Services};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repo_root = PathBuf::from(".");
//!     let config = load_config_or_default(&repo_root.join("dlc-orchestrator.toml"))?;
//!     let env = Environment::from_env(repo_root.clone())?;
//!     let runs = orchestrator::prepare(&env)?;
//!
//!     let cancel = CancellationToken::new();
//!     let services = Services::aws(&config, "us-west-2", &repo_root, cancel.clone()).await;
//!     let results = Orchestrator::new(config, env, services, cancel)?.run(&runs).await;
//!
//!     std::process::exit(orchestrator::exit_code(&results));
//! }
//! ```

pub mod adapter;
pub mod buildspec;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod image;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod provider;
pub mod remote;
pub mod report;
pub mod telemetry;
pub mod waiter;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use dispatcher::{TestResult, TestStatus};
pub use orchestrator::{Orchestrator, RunResult};
pub use report::Reporter;
