//! Cleanup coordinator.
//!
//! Once the dispatcher has finished (passed, failed or cancelled), the
//! coordinator walks the ledger snapshot newest first and releases every
//! handle through the provider. Each release gets its own timeout; a
//! failure is recorded and the walk goes on. Dependency order needs no
//! special casing: acquisitions happened in forward dependency order, so
//! reverse append order deletes filesystems before their security groups
//! and instances before their key pairs.
//!
//! The janitor applies the same walk to resources left behind by earlier
//! runs, selected by their `created-at` tag.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::ledger::{Resource, ResourceLedger};
use crate::provider::{ProvisionError, ResourceProvider, tag_key};

/// One release that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupFailure {
    /// `#<seq> <kind> <id>`, or `<kind> <id>` for janitor releases.
    pub resource: String,
    pub error: String,
}

/// What a cleanup walk did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Identifiers released, in release order.
    pub released: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.released.extend(other.released);
        self.failures.extend(other.failures);
    }

    /// Writes the failure summary to stderr when there is one.
    pub fn print_failures(&self) {
        if self.is_clean() {
            return;
        }
        eprintln!();
        eprintln!(
            "{}",
            console::style(format!("Cleanup errors ({}):", self.failures.len()))
                .red()
                .bold()
        );
        for failure in &self.failures {
            eprintln!("  - {}: {}", failure.resource, failure.error);
        }
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} released, {} failed",
            self.released.len(),
            self.failures.len()
        )
    }
}

/// Releases ledger handles in reverse creation order.
pub struct CleanupCoordinator {
    provider: Arc<ResourceProvider>,
    release_timeout: Duration,
}

impl CleanupCoordinator {
    pub fn new(provider: Arc<ResourceProvider>, release_timeout: Duration) -> Self {
        Self {
            provider,
            release_timeout,
        }
    }

    /// Releases everything in `ledger`, newest first.
    pub async fn release_all(&self, ledger: &ResourceLedger) -> CleanupReport {
        let handles = ledger.snapshot();
        info!(run = %ledger.run_id(), count = handles.len(), "Releasing run resources");

        let mut report = CleanupReport::default();
        for handle in handles.iter().rev() {
            let label = handle.to_string();
            self.release_one(&handle.resource, label, &mut report).await;
        }

        info!(run = %ledger.run_id(), "Cleanup finished: {}", report);
        report
    }

    /// Releases resources of any run whose `created-at` tag is older than
    /// `max_age`.
    pub async fn janitor(&self, max_age: Duration) -> Result<CleanupReport, ProvisionError> {
        let created_key = tag_key(self.provider.ledger().tag_prefix(), "created-at");
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(5200));

        let mut stale: Vec<(DateTime<Utc>, Resource)> = self
            .provider
            .list_tagged()
            .await?
            .into_iter()
            .filter_map(|tagged| {
                let created = tagged
                    .tags
                    .get(&created_key)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
                    .with_timezone(&Utc);
                (created < cutoff).then_some((created, tagged.resource))
            })
            .collect();

        // Newest first, like a ledger walk.
        stale.sort_by(|a, b| b.0.cmp(&a.0));
        info!(count = stale.len(), max_age = ?max_age, "Releasing stale resources");

        let mut report = CleanupReport::default();
        for (_, resource) in &stale {
            let label = format!("{} {}", resource.kind(), resource.id());
            self.release_one(resource, label, &mut report).await;
        }
        Ok(report)
    }

    async fn release_one(&self, resource: &Resource, label: String, report: &mut CleanupReport) {
        match tokio::time::timeout(self.release_timeout, self.provider.release(resource)).await {
            Ok(Ok(())) => {
                info!(resource = %label, "Released");
                report.released.push(label);
            }
            Ok(Err(e)) => {
                warn!(resource = %label, error = %e, "Release failed");
                report.failures.push(CleanupFailure {
                    resource: label,
                    error: e.to_string(),
                });
            }
            Err(_) => {
                warn!(resource = %label, timeout = ?self.release_timeout, "Release timed out");
                report.failures.push(CleanupFailure {
                    resource: label,
                    error: format!("timed out after {:?}", self.release_timeout),
                });
            }
        }
    }
}
