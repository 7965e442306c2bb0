//! Configuration loading and schema definitions for dlc-orchestrator.
//!
//! The settings file is optional: [`load_config_or_default`] returns the
//! defaults when the file does not exist, so CI jobs only need a file when
//! they deviate from the standard timeouts, AMIs or thresholds.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Name of the settings file looked up in the repository root.
pub const DEFAULT_CONFIG_FILE: &str = "dlc-orchestrator.toml";

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use dlc_orchestrator::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [orchestrator]
///     max_parallel = 4
///
///     [remote]
///     connect_attempts = 3
/// "#)?;
///
/// assert_eq!(config.orchestrator.max_parallel, 4);
/// assert_eq!(config.remote.connect_attempts, 3);
/// assert_eq!(config.remote.command_timeout_secs, 1800);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads `path` when it exists, otherwise returns the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!("No config file at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

/// Renders the default configuration as commented TOML for `init`.
pub fn default_config_toml() -> Result<String> {
    let body = toml::to_string_pretty(&Config::default()).context("Failed to render config")?;
    Ok(format!(
        "# dlc-orchestrator configuration file\n#\n# Every value below is the built-in default.\n\n{}",
        body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();

        assert_eq!(config.orchestrator.tag_prefix, "dlc-ci");
        assert_eq!(config.orchestrator.release_timeout_secs, 600);
        assert_eq!(config.provider.retry_attempts, 10);
        assert_eq!(config.provider.instance_ready_timeout_secs, 960);
        assert_eq!(config.remote.connect_attempts, 16);
        assert_eq!(config.remote.connect_interval_secs, 60);
        assert_eq!(config.kubernetes.ready_poll_interval_secs, 300);
        assert_eq!(config.kubernetes.ready_timeout_secs, 12000);
        assert_eq!(config.serving.ready_timeout_secs, 2100);
        assert_eq!(config.telemetry.namespace, "DLCCI");
        assert!(config.report.junit);
    }

    #[test]
    fn test_zone_overrides_and_thresholds() {
        let config = load_config_str(
            r#"
            [[provider.zone_overrides]]
            instance_type = "p5.48xlarge"
            region = "us-east-1"
            zones = ["us-east-1a", "us-east-1b"]

            [[thresholds]]
            framework = "pytorch"
            processor = "gpu"
            workload = "benchmark-throughput"
            value = 1000.0
            "#,
        )
        .unwrap();

        assert_eq!(config.provider.zone_overrides.len(), 1);
        assert_eq!(config.provider.zone_overrides[0].zones.len(), 2);
        assert_eq!(config.thresholds[0].versions, "*");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(load_config_str("[orchestrator]\nmax_paralel = 3\n").is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let rendered = default_config_toml().unwrap();
        let parsed = load_config_str(&rendered).unwrap();
        assert_eq!(parsed.remote.command_timeout_secs, 1800);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.orchestrator.max_parallel, 10);
    }
}
