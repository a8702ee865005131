//! fanpipe CLI
//!
//! Runs the squares demo pipeline from a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fanpipe::{build_runtime, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "fanpipe")]
#[command(about = "Square a number sequence through a fan-out/fan-in pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override replicas per transform stage
    #[arg(long, global = true)]
    replicas: Option<usize>,

    /// Override conduit buffer capacity (0 = rendezvous)
    #[arg(long, global = true)]
    buffer: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.replicas, cli.buffer)?;
            run_command(config)?;
        }

        Some(Commands::Validate) => {
            load_config(&cli.config, cli.replicas, cli.buffer)?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

/// Read the config file, falling back to defaults when it does not exist,
/// and apply command-line overrides.
fn load_config(path: &PathBuf, replicas: Option<usize>, buffer: Option<usize>) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        tracing::info!("No config at {}, using defaults", path.display());
        Config::default()
    };

    if let Some(r) = replicas {
        config.pipeline.replica_count = r;
    }
    if let Some(b) = buffer {
        config.pipeline.buffer_capacity = b;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    let runtime = build_runtime(config.runtime.worker_threads)?;
    let report = runtime.block_on(async { run_pipeline(config).await })?;

    println!("\n=== Summary ===");
    println!("Outputs read: {}", report.outputs.len());
    println!("{}", report.stats);
    if report.stats.cancelled {
        println!("Stopped early");
    }
    println!("===============\n");

    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# fanpipe configuration

# === PIPELINE: shape and failure policy ===
pipeline:
  # Items each conduit can hold (0 = rendezvous, every hand-off waits for a reader)
  buffer_capacity: 0

  # Parallel replicas of the transform stage
  replica_count: 2

  # abort_pipeline: stop everything on the first failure
  # skip_item: drop the failing item and continue
  on_error: abort_pipeline

  # Log throughput periodically while running
  enable_metrics: false
  metrics_interval_secs: 10

  # Write a JSON metrics snapshot when the pipeline finishes
  # metrics_output_path: "metrics.json"

# === RUN: the squares demo ===
run:
  # First seed value
  start: 1

  # Number of seeds (omit for an endless sequence; then `take` is required)
  count: 5

  # Cancel after reading this many results
  # take: 2

  # Make the transform fail for multiples of this value
  # fail_multiples_of: 3

# === RUNTIME: Tokio tuning ===
runtime:
  # Tokio worker threads (null = num CPUs)
  worker_threads: null
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["fanpipe"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from(["fanpipe", "run", "--replicas", "4", "--buffer", "8"]).unwrap();
        assert_eq!(cli.replicas, Some(4));
        assert_eq!(cli.buffer, Some(8));
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["fanpipe", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        generate_config_command(path.clone()).unwrap();

        let config = load_config(&path, None, Some(3)).unwrap();
        assert_eq!(config.pipeline.buffer_capacity, 3);
        assert_eq!(config.run.count, Some(5));
    }

    #[test]
    fn test_zero_replica_override_rejected() {
        let path = PathBuf::from("does-not-exist.yaml");
        assert!(load_config(&path, Some(0), None).is_err());
    }
}
