//! # VulnScan Configuration Validator
//!
//! Command-line tool for validating scanner configuration across environments.
//! Catches bad values before a scheduling center or node agent is started.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use vulnscan_core::config::{ConfigManager, ScannerConfig};

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate VulnScan configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long)]
    environment: Option<String>,

    /// Configuration directory (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the layered configuration
    Validate,

    /// Print the effective configuration after layering
    Show,

    /// List environment overlays found in the configuration directory
    Environments,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Validate) | None => validate(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn environment(cli: &Cli) -> String {
    cli.environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment)
}

fn load(cli: &Cli) -> Result<ScannerConfig> {
    let environment = environment(cli);
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &environment)
        .with_context(|| format!("loading configuration for environment '{environment}'"))?;
    Ok(manager.config().clone())
}

fn validate(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    let environment = environment(cli);

    if cli.format == "json" {
        let summary = serde_json::json!({
            "environment": environment,
            "valid": true,
            "scheduler": {
                "partition_size": config.scheduler.partition_size,
                "max_shard_retries": config.scheduler.max_shard_retries,
                "queue_watermark": config.scheduler.queue_watermark,
            },
            "node": {
                "worker_concurrency": config.node.worker_concurrency,
            },
            "database": config.database.url.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("🔧 Validating VulnScan configuration");
    println!("Environment: {environment}");
    println!();
    println!("✅ Configuration loaded and validated");
    println!("  scheduler.partition_size      {}", config.scheduler.partition_size);
    println!("  scheduler.max_shard_retries   {}", config.scheduler.max_shard_retries);
    println!("  scheduler.queue_watermark     {}", config.scheduler.queue_watermark);
    println!(
        "  scheduler.heartbeat_timeout   {}s",
        config.scheduler.heartbeat_timeout_secs
    );
    println!("  node.worker_concurrency       {}", config.node.worker_concurrency);
    println!(
        "  database                      {}",
        if config.database.url.is_some() {
            "postgres"
        } else {
            "in-memory"
        }
    );
    Ok(())
}

fn show_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn list_environments(cli: &Cli) -> Result<()> {
    let dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config"));
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("reading configuration directory {}", dir.display()))?;

    let mut environments: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            name.strip_prefix("vulnscan.")
                .and_then(|rest| rest.strip_suffix(".toml"))
                .filter(|env| !env.is_empty())
                .map(str::to_string)
        })
        .collect();
    environments.sort();

    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&environments)?);
    } else {
        println!("📋 Environments in {}:", dir.display());
        for env in environments {
            println!("  - {env}");
        }
    }
    Ok(())
}
