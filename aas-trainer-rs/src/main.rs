//! CLI entry point for aas-trainer-rs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aas_trainer_rs::{AasConfig, CheckpointManager, Result};

#[derive(Parser)]
#[command(name = "aas")]
#[command(about = "Adversarial speech enhancement training toolkit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "aas.yaml")]
        output: PathBuf,
        /// Preset (default, debug)
        #[arg(long, default_value = "default")]
        preset: String,
    },
    /// Print the iteration a resume from a run directory would start at
    ResumePoint {
        /// Run directory holding manifest.json
        dir: PathBuf,
        /// Requested start iteration; 0 infers it from the best snapshots
        #[arg(long, default_value_t = 0)]
        start_iter: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = AasConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Output: {}", config.output_dir.display());
            println!(
                "  Iterations: {}..{}",
                config.schedule.start_iter, config.schedule.max_iter
            );
            println!(
                "  Recognizer warm-up: {} iterations",
                config.schedule.allow_asr_update_iter
            );
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = AasConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::ResumePoint { dir, start_iter } => {
            let manager = CheckpointManager::open_existing(&dir)?;
            let iteration = manager.resume_iteration(start_iter)?;
            println!("{iteration}");
        }
    }

    Ok(())
}
