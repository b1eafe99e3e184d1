//! `livescan models`: report on the artifacts in the model directory.

use anyhow::{bail, Result};
use livescan_models::ModelFiles;
use std::path::Path;

pub fn run(model_dir: &Path, files: &ModelFiles) -> Result<()> {
    println!("Model directory: {}", model_dir.display());

    let reports = livescan_models::inspect_models_dir(model_dir, files);
    let mut problems = 0;

    for report in &reports {
        let name = report.kind.as_str();
        let Some(size) = report.size else {
            println!("  {name:<20} MISSING  {}", report.path.display());
            problems += 1;
            continue;
        };

        let digest = report.sha256.as_deref().unwrap_or("unreadable");
        let verdict = match report.checksum_ok() {
            Some(true) => "checksum ok",
            Some(false) => {
                problems += 1;
                "CHECKSUM MISMATCH"
            }
            None => "no checksum listed",
        };
        println!(
            "  {name:<20} {:>10}  {digest}  {verdict}  {}",
            human_size(size),
            report.path.display()
        );
    }

    if problems > 0 {
        bail!("{problems} model artifact(s) missing or corrupt");
    }
    println!("All model artifacts present.");
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(166 * 1024 * 1024), "166.0 MB");
    }

    #[test]
    fn test_run_fails_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), &ModelFiles::default()).is_err());
    }
}
