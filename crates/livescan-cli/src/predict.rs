//! `livescan predict`: run the ensemble on one image file.

use anyhow::{anyhow, Context, Result};
use livescan_core::{Device, EnsemblePipeline, ModelFiles, PipelineError, SessionOptions};
use std::path::Path;

pub fn run(
    model_dir: &Path,
    files: &ModelFiles,
    image_path: &Path,
    device: &str,
    threads: usize,
    json: bool,
) -> Result<()> {
    let device: Device = device.parse().map_err(|e: String| anyhow!(e))?;

    let bytes = std::fs::read(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let image = livescan_core::decode_image_bytes(&bytes)
        .with_context(|| format!("failed to decode {}", image_path.display()))?;

    let options = SessionOptions {
        device,
        intra_threads: threads.max(1),
    };
    let mut pipeline = EnsemblePipeline::load(model_dir, files, &options);
    let prediction = match pipeline.try_predict(&image) {
        Ok(prediction) => prediction,
        Err(e @ PipelineError::Unavailable(_)) => {
            tracing::warn!(
                model_dir = %model_dir.display(),
                "ensemble incomplete; run `livescan models` or `livescan fetch`"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    tracing::debug!(image = %image_path.display(), class = %prediction.class, "classified");

    if json {
        println!("{}", serde_json::to_string(&prediction)?);
    } else {
        println!(
            "{}: {} (confidence {:.4})",
            image_path.display(),
            prediction.class,
            prediction.confidence
        );
    }
    Ok(())
}
