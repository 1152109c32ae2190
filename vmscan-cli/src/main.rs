use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use vmscan_core::{ErrorCategory, LogOptions, ScanConfig, ScanError, Severity};

mod commands;

/// Exit status for configuration and usage errors.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "vmscan")]
#[command(about = "Vulnerability-scan cloud VM images on disposable instances", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (JSON); defaults to <config dir>/vmscan/config.json
    #[arg(short, long, global = true, env = "VMSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan one image, or every image matching a name prefix
    Scan(commands::scan::ScanArgs),

    /// Interpret a Trivy JSON report offline
    Interpret {
        /// Path to the Trivy report
        #[arg(short, long)]
        file: PathBuf,

        /// Minimum severity that fails the report (defaults to the configured threshold)
        #[arg(short, long)]
        threshold: Option<Severity>,

        /// Print the retained findings as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the boot script handed to scan instances
    BootScript {
        /// Finding IDs to ignore (repeatable)
        #[arg(long = "ignore")]
        ignore: Vec<String>,

        /// Trivy version to install when the image lacks it
        #[arg(long)]
        trivy_version: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            exit_code_for(&e)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ScanConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let metrics_addr = match &cli.command {
        Commands::Scan(args) => args.metrics_addr,
        _ => None,
    };
    vmscan_core::init_observability(&LogOptions {
        level: cli.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        json: cli.log_json,
        metrics_addr,
    })
    .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Scan(args) => commands::scan::scan(args, config).await,

        Commands::Interpret { file, threshold, json } => {
            let threshold = threshold.unwrap_or(config.severity_threshold);
            commands::interpret::interpret(&file, threshold, json).await
        }

        Commands::BootScript { ignore, trivy_version } => {
            commands::boot_script::boot_script(config, ignore, trivy_version)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config => {
            commands::config::show(&config, cli.config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// 2 for configuration/usage problems, 1 for everything else.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ScanError>() {
        Some(e) if e.category() == ErrorCategory::Config => ExitCode::from(EXIT_USAGE),
        _ => ExitCode::FAILURE,
    }
}
