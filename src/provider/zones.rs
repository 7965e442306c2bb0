//! Availability-zone selection.
//!
//! Capacity-constrained GPU types only launch reliably in a few zones. The
//! allowlist below, extended by `[[provider.zone_overrides]]`, takes
//! precedence over zone discovery for the `(instance type, region)` pairs it
//! names.

use crate::config::ZoneOverride;

/// Known-good zones for capacity-constrained instance types.
const BUILTIN_ZONES: &[(&str, &str, &[&str])] = &[
    ("p4d.24xlarge", "us-west-2", &["us-west-2b", "us-west-2c"]),
    ("p4de.24xlarge", "us-east-1", &["us-east-1d", "us-east-1c"]),
];

/// Resolves the ordered zone preference list for an instance type.
#[derive(Debug, Clone, Default)]
pub struct ZoneSelector {
    overrides: Vec<ZoneOverride>,
}

impl ZoneSelector {
    pub fn new(overrides: Vec<ZoneOverride>) -> Self {
        Self { overrides }
    }

    /// Allowlisted zones, configured rows first; `None` means discover.
    pub fn allowlist(&self, instance_type: &str, region: &str) -> Option<Vec<String>> {
        if let Some(row) = self
            .overrides
            .iter()
            .find(|o| o.instance_type == instance_type && o.region == region)
        {
            return Some(row.zones.clone());
        }
        BUILTIN_ZONES
            .iter()
            .find(|(t, r, _)| *t == instance_type && *r == region)
            .map(|(_, _, zones)| zones.iter().map(|z| z.to_string()).collect())
    }

    /// The zones to try in order.
    ///
    /// An explicit `preferred` list from the entry wins, then the allowlist,
    /// then every zone the region reports.
    pub fn candidates(
        &self,
        instance_type: &str,
        region: &str,
        preferred: &[String],
        discovered: &[String],
    ) -> Vec<String> {
        if !preferred.is_empty() {
            return preferred.to_vec();
        }
        self.allowlist(instance_type, region)
            .unwrap_or_else(|| discovered.to_vec())
    }
}
