//! `livescan encode`: build an `image` event for manual testing.

use anyhow::{Context, Result};
use base64::Engine as _;
use std::path::Path;

/// The envelope livescand expects on its WebSocket channel.
fn image_event(bytes: &[u8]) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    serde_json::json!({ "event": "image", "data": { "image": encoded } })
}

pub fn run(image_path: &Path) -> Result<()> {
    let bytes = std::fs::read(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    // Refuse to encode something the daemon would silently drop.
    livescan_core::decode_image_bytes(&bytes)
        .with_context(|| format!("{} is not a decodable image", image_path.display()))?;

    println!("{}", image_event(&bytes));
    Ok(())
}
