use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod encode;
mod fetch;
mod health;
mod models;
mod predict;

#[derive(Parser)]
#[command(name = "livescan", version, about = "Face-liveness ensemble tooling")]
struct Cli {
    /// Model directory (default: $LIVESCAN_MODEL_DIR or the per-user data dir).
    #[arg(long, global = true, env = "LIVESCAN_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify an image file with the local models.
    Predict {
        /// Image file (PNG, JPEG, ...).
        image: PathBuf,
        /// Compute device: auto, cpu, cuda or cuda:N.
        #[arg(long, default_value = "auto")]
        device: String,
        /// Intra-op threads per ONNX session.
        #[arg(long, default_value_t = 1)]
        threads: usize,
        /// Print the result as a prediction_result JSON payload.
        #[arg(long)]
        json: bool,
    },
    /// Show presence, size and checksum of each model artifact.
    Models,
    /// Download missing or corrupt model artifacts.
    Fetch {
        /// Base URL the artifacts (and an optional SHA256SUMS) are served from.
        #[arg(long)]
        base_url: String,
    },
    /// Probe a running livescand.
    Health {
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,
    },
    /// Print an `image` event for an image file, ready to send over the WebSocket.
    Encode {
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli
        .model_dir
        .unwrap_or_else(livescan_core::default_model_dir);
    // Same filename overrides as livescand, so both look at the same artifacts.
    let files = livescan_models::ModelFiles::from_env();
    tracing::debug!(model_dir = %model_dir.display(), ?files, "resolved model artifacts");

    match cli.command {
        Command::Predict {
            image,
            device,
            threads,
            json,
        } => predict::run(&model_dir, &files, &image, &device, threads, json),
        Command::Models => models::run(&model_dir, &files),
        Command::Fetch { base_url } => fetch::run(model_dir, &files, &base_url),
        Command::Health { url } => health::run(&url),
        Command::Encode { image } => encode::run(&image),
    }
}
