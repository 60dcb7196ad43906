//! gridpair - paired-order grid trading decision core
//!
//! This binary provides three subcommands:
//! - replay: drive a recorded price series through the pair state machine
//! - explore: random event walk with invariant auditing
//! - predict: load a snapshot and print the pair report

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "gridpair")]
#[command(about = "Paired-order grid trading decision core with statistical sizing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded price series through the state machine
    Replay {
        /// Path to configuration file (defaults + env overrides when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// CSV price series with timestamp,price columns
        #[arg(short, long)]
        data: String,

        /// Force long-only mode (no sell entries)
        #[arg(long)]
        long_only: bool,
    },

    /// Run a random event walk and audit the structural invariants
    Explore {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Number of random events
        #[arg(short, long, default_value = "10000")]
        steps: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Print the pair report for a saved snapshot
    Predict {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Path to a snapshot JSON file
        #[arg(short, long)]
        snapshot: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Replay { .. } => "replay",
        Commands::Explore { .. } => "explore",
        Commands::Predict { .. } => "predict",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Replay {
            config,
            data,
            long_only,
        } => commands::replay::run(config, data, long_only),

        Commands::Explore {
            config,
            steps,
            seed,
        } => commands::explore::run(config, steps, seed),

        Commands::Predict { config, snapshot } => commands::predict::run(config, snapshot),
    }
}
