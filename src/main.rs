//! `ferrite` command line.
//!
//! - `run`             train against the simulated backend
//! - `check-config`    validate a configuration and print the slot layout
//! - `default-config`  print the default configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ferrite::config::{Config, WorldLayout};
use ferrite::data::load_datasets;
use ferrite::pipeline::{Pipeline, write_report};
use ferrite::{logging, sim};

#[derive(Parser)]
#[command(name = "ferrite", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until `finetune.max_train_steps`.
    Run {
        /// JSON configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration and print the resolved layout.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the default configuration as JSON.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config.as_deref()).await,
        Commands::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            let layout = resolve_layout(&config)?;
            println!("{}", serde_json::to_string_pretty(&layout)?);
            Ok(())
        }
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&Config::default())?);
            Ok(())
        }
    }
}

async fn run(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    logging::init(Some(&config.output_dir.join("log"))).context("failed to set up logging")?;
    let layout = resolve_layout(&config)?;

    let (train, test) = match &config.data_dir {
        Some(dir) => (
            load_datasets(dir, &config.train_dataset_names).context("failed to load training data")?,
            load_datasets(dir, &config.test_dataset_names).context("failed to load test data")?,
        ),
        None => {
            info!("no data_dir configured, using synthetic prompts");
            sim::datasets(&config)
        }
    };

    let backend = sim::backend(&config, &layout);
    let report_path = config.output_dir.join("report.json");
    let report = Pipeline::new(config, backend, train, test)?
        .run()
        .await
        .context("pipeline failed")?;

    write_report(&report, &report_path).with_context(|| format!("failed to write {}", report_path.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn resolve_layout(config: &Config) -> Result<WorldLayout> {
    Ok(WorldLayout::resolve(
        &config.world,
        config.vllm_config.vllm_kwargs.tensor_parallel_size,
    )?)
}
