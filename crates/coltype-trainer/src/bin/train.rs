use std::path::PathBuf;

use clap::Parser;
use coltype_core::Config;
use coltype_trainer::run_training;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Fine-tune a BERT column-type classifier.
#[derive(Parser)]
#[command(name = "train")]
#[command(version)]
struct Cli {
    /// Training configuration file
    #[arg(default_value = "config.json")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = Config::from_file(&cli.config)
        .map_err(anyhow::Error::from)
        .and_then(|config| run_training(&config));

    if let Err(e) = result {
        error!("Training failed: {e:#}");
        std::process::exit(1);
    }
}
