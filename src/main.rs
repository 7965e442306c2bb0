//! dlc-orchestrator CLI - multi-platform test orchestration for DLC images.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dlc_orchestrator::cleanup::CleanupCoordinator;
use dlc_orchestrator::config::{self, Config, DEFAULT_CONFIG_FILE};
use dlc_orchestrator::dispatcher::{self, Selected};
use dlc_orchestrator::environment::{Environment, find_repo_root};
use dlc_orchestrator::ledger::ResourceLedger;
use dlc_orchestrator::orchestrator::{
    self, EXIT_CONFIG_ERROR, Orchestrator, PreparedRun, Services,
};
use dlc_orchestrator::provider::ResourceProvider;
use dlc_orchestrator::report::{ConsoleReporter, JUnitReporter, MultiReporter};

#[derive(Parser)]
#[command(name = "dlc-orchestrator")]
#[command(about = "Multi-platform test orchestration for Deep Learning Container images", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: <repo-root>/dlc-orchestrator.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository root holding the buildspecs [default: nearest ancestor with .git]
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests of every image in DLC_IMAGE
    Run {
        /// Override the size of parallel groups
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Skip the JUnit XML report
        #[arg(long)]
        no_junit: bool,
    },

    /// Validate the buildspec and configuration without creating anything
    Validate,

    /// Show which entries would run for each image
    Plan {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Release resources left behind by earlier runs
    Janitor {
        /// Release resources created more than this many minutes ago
        #[arg(long, default_value_t = 240)]
        max_age_minutes: u64,

        /// Region to sweep
        #[arg(long, env = "REGION")]
        region: String,
    },

    /// Write a configuration file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format)?;

    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let repo_root = cli.repo_root.clone().unwrap_or_else(|| find_repo_root(&cwd));
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| repo_root.join(DEFAULT_CONFIG_FILE));

    match cli.command {
        Commands::Run { parallel, no_junit } => {
            let mut config = load_config_or_exit(&config_path);
            if let Some(parallel) = parallel {
                config.orchestrator.max_parallel = parallel;
            }
            if no_junit {
                config.report.junit = false;
            }
            run(config, repo_root, cli.verbose).await
        }
        Commands::Validate => validate(&config_path, repo_root),
        Commands::Plan { format } => show_plan(&config_path, repo_root, format),
        Commands::Janitor {
            max_age_minutes,
            region,
        } => janitor(&config_path, &region, &repo_root, max_age_minutes).await,
        Commands::Init { force } => init_config(&config_path, force),
    }
}

fn init_tracing(verbose: bool, format: LogFormat) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}

fn config_error(e: impl std::fmt::Display) -> ! {
    eprintln!("Configuration error: {}", e);
    std::process::exit(EXIT_CONFIG_ERROR);
}

fn load_config_or_exit(path: &Path) -> Config {
    config::load_config_or_default(path).unwrap_or_else(|e| config_error(format!("{:#}", e)))
}

fn prepare_or_exit(repo_root: PathBuf) -> (Environment, Vec<PreparedRun>) {
    let env = Environment::from_env(repo_root).unwrap_or_else(|e| config_error(e));
    let runs = orchestrator::prepare(&env).unwrap_or_else(|e| config_error(e));
    (env, runs)
}

async fn run(config: Config, repo_root: PathBuf, verbose: bool) -> Result<()> {
    let (env, runs) = prepare_or_exit(repo_root.clone());

    let region = env
        .region
        .clone()
        .or_else(|| {
            runs.iter()
                .map(|r| r.plan.globals.region.clone())
                .find(|r| !r.is_empty())
        })
        .unwrap_or_else(|| config_error("no region: set REGION or `region` in the buildspec"));

    let cancel = CancellationToken::new();
    orchestrator::cancel_on_shutdown(cancel.clone())
        .context("Failed to install signal handlers")?;

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if config.report.junit {
        reporter = reporter.with_reporter(JUnitReporter::new(
            config.report.output_dir.clone(),
            config.report.junit_file.clone(),
        ));
    }

    let services = Services::aws(&config, &region, &repo_root, cancel.clone()).await;
    let orchestrator = Orchestrator::new(config, env, services, cancel)
        .unwrap_or_else(|e| config_error(e))
        .with_reporter(Arc::new(reporter));

    let results = orchestrator.run(&runs).await;
    let code = orchestrator::exit_code(&results);
    info!(images = results.len(), exit_code = code, "All runs finished");
    std::process::exit(code);
}

fn validate(config_path: &Path, repo_root: PathBuf) -> Result<()> {
    let config = load_config_or_exit(config_path);
    let (env, runs) = prepare_or_exit(repo_root);
    dlc_orchestrator::telemetry::ThresholdTable::new(
        &config.thresholds,
        !config.telemetry.disable_builtin_thresholds,
    )
    .unwrap_or_else(|e| config_error(e));

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Test type:    {}", env.test_type);
    println!("  Build context: {}", env.build_context);
    println!("  Max parallel: {}", config.orchestrator.max_parallel);
    println!("  Tag prefix:   {}", config.orchestrator.tag_prefix);
    for run in &runs {
        println!();
        println!("  {} ({})", run.image, run.image_name);
        println!("    Buildspec: {}", run.buildspec.display());
        println!(
            "    Entries:   {}",
            run.plan.entries_for(&run.image_name).len()
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct PlanRow<'a> {
    image: &'a str,
    entry: &'a str,
    platform: &'a str,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_group: Option<&'a str>,
    commands: &'a [String],
}

fn show_plan(config_path: &Path, repo_root: PathBuf, format: OutputFormat) -> Result<()> {
    let _ = load_config_or_exit(config_path);
    let (env, runs) = prepare_or_exit(repo_root);

    let mut rows = Vec::new();
    for run in &runs {
        for selected in dispatcher::select(&run.plan, &run.image_name, &run.image, env.test_type)
        {
            let (entry, action, reason) = match selected {
                Selected::Run(entry) => (entry, "run", None),
                Selected::Skip(entry, reason) => (entry, "skip", Some(reason)),
            };
            rows.push(PlanRow {
                image: &run.image.uri,
                entry: &entry.id,
                platform: &entry.platform.tag,
                action,
                reason,
                parallel_group: entry.parallel_group.as_deref(),
                commands: &entry.run,
            });
        }
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            println!("{} entries for {} images ({}):", rows.len(), runs.len(), env.test_type);
            for row in &rows {
                let group = row
                    .parallel_group
                    .map(|g| format!(" [group {}]", g))
                    .unwrap_or_default();
                match &row.reason {
                    None => println!("  {} {}{}", console::style("run ").green(), row.entry, group),
                    Some(reason) => println!(
                        "  {} {} ({})",
                        console::style("skip").yellow(),
                        row.entry,
                        console::style(reason).dim()
                    ),
                }
            }
        }
    }
    Ok(())
}

async fn janitor(
    config_path: &Path,
    region: &str,
    repo_root: &Path,
    max_age_minutes: u64,
) -> Result<()> {
    let config = load_config_or_exit(config_path);
    let cancel = CancellationToken::new();
    let services = Services::aws(&config, region, repo_root, cancel.clone()).await;

    let ledger = Arc::new(ResourceLedger::new(
        "janitor",
        region,
        config.orchestrator.tag_prefix.clone(),
    ));
    let provider = Arc::new(ResourceProvider::new(
        services.cloud,
        services.kube,
        ledger,
        config.provider.clone(),
        cancel,
    ));
    let coordinator = CleanupCoordinator::new(
        provider,
        Duration::from_secs(config.orchestrator.release_timeout_secs),
    );

    let report = coordinator
        .janitor(Duration::from_secs(max_age_minutes * 60))
        .await
        .context("Failed to list tagged resources")?;

    println!("Janitor: {}", report);
    for released in &report.released {
        println!("  - {}", released);
    }
    report.print_failures();
    if !report.is_clean() {
        std::process::exit(3);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        eprintln!(
            "{} already exists. Remove it first, pass --force, or edit manually.",
            path.display()
        );
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    let body = config::default_config_toml()?;
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  dlc-orchestrator validate");

    Ok(())
}
