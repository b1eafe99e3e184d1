//! `livescan health`: query a running daemon's liveness and status endpoints.

use anyhow::{bail, Context, Result};

pub fn run(base_url: &str) -> Result<()> {
    let base = base_url.trim_end_matches('/');

    let index = get_text(&format!("{base}/"))?;
    println!("{base}: {index}");

    let status: serde_json::Value = serde_json::from_str(&get_text(&format!("{base}/status"))?)
        .context("status endpoint returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if status["ready"] != serde_json::Value::Bool(true) {
        bail!("daemon is running but the ensemble is not ready");
    }
    Ok(())
}

fn get_text(url: &str) -> Result<String> {
    let mut resp = ureq::get(url)
        .call()
        .with_context(|| format!("request to {url} failed"))?;
    resp.body_mut()
        .read_to_string()
        .with_context(|| format!("failed to read response from {url}"))
}
