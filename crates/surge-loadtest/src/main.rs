//! # Surge API Load Driver CLI
//!
//! Command-line interface for running rate-limit aware load against the API.
//!
//! ## Usage
//!
//! ```bash
//! # Full run (smoke, load, rate-limit stress)
//! surge-loadtest --target http://localhost:8080/api
//!
//! # Only the smoke stage
//! surge-loadtest smoke --target http://localhost:8080/api
//!
//! # Selected stages from a config file, reproducible
//! surge-loadtest run --config surge.toml --scenario load --seed 7
//!
//! # Print the resolved configuration
//! surge-loadtest check-config --config surge.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use surge_loadtest::{LoadTestConfig, LoadTestRunner};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "surge-loadtest")]
#[command(author = "Surge Team")]
#[command(version)]
#[command(about = "Rate-limit aware load driver for the Surge API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Target API base URL
    #[arg(short, long, global = true, env = "SURGE_BASE_URL")]
    target: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run only the named scenario (repeatable)
    #[arg(short, long = "scenario", global = true)]
    scenarios: Vec<String>,

    /// Seed for every virtual user's random source
    #[arg(long, global = true, env = "SURGE_SEED")]
    seed: Option<u64>,

    /// Test account phone number
    #[arg(long, global = true, env = "SURGE_NUMBER")]
    number: Option<String>,

    /// Test account password
    #[arg(long, global = true, env = "SURGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Referral code used by registrations
    #[arg(long, global = true, env = "SURGE_REFERRAL_CODE")]
    referral_code: Option<String>,

    /// JSON summary output path
    #[arg(short, long, global = true)]
    output: Option<String>,

    /// Also write the final metrics in Prometheus text format
    #[arg(long, global = true)]
    prometheus: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the configured stages (default)
    Run,

    /// Run the smoke stage only
    Smoke,

    /// Load, validate and print the resolved configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    info!("Surge API Load Driver v{}", env!("CARGO_PKG_VERSION"));

    let command = cli.command.unwrap_or(Commands::Run);
    let config = resolve_config(&cli, command)?;

    if command == Commands::CheckConfig {
        config.validate()?;
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let runner = LoadTestRunner::new(config.clone()).context("Failed to set up load test")?;
    let outcome = match runner.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Load test aborted: {}", e);
            return Err(e.into());
        }
    };

    outcome.summary.print_report();
    outcome.thresholds.print_report();
    outcome
        .write_outputs(&config.run)
        .context("Failed to write run outputs")?;

    if outcome.passed() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(false).with_file(false))
            .init();
    }
}

/// Defaults, then the config file, then flags and environment
fn resolve_config(cli: &Cli, command: Commands) -> anyhow::Result<LoadTestConfig> {
    let mut config = LoadTestConfig::load(cli.config.as_deref())?;

    if let Some(target) = &cli.target {
        config.target.base_url = target.clone();
    }
    if let Some(number) = &cli.number {
        config.credentials.number = number.clone();
    }
    if let Some(password) = &cli.password {
        config.credentials.password = password.clone();
    }
    if let Some(code) = &cli.referral_code {
        config.credentials.referral_code = code.clone();
    }
    if cli.seed.is_some() {
        config.run.seed = cli.seed;
    }
    if let Some(output) = &cli.output {
        config.run.artifact_path = output.clone();
    }
    if cli.prometheus.is_some() {
        config.run.prometheus_path = cli.prometheus.clone();
    }

    let mut selected = cli.scenarios.clone();
    if command == Commands::Smoke {
        selected = vec!["smoke".to_string()];
    }
    config.select_scenarios(&selected)?;

    Ok(config)
}
