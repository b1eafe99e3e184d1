//! `livescan fetch`: downloads the ensemble's model artifacts into the model directory.

use anyhow::{bail, Context, Result};
use livescan_models::{ArtifactKind, ModelFiles, CHECKSUM_FILE};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Join a base URL and a file name with exactly one slash.
fn artifact_url(base_url: &str, name: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), name)
}

/// Fetch `SHA256SUMS` from the artifact host. Missing list means no verification.
fn fetch_checksums(base_url: &str) -> Result<Option<String>> {
    let url = artifact_url(base_url, CHECKSUM_FILE);
    match ureq::get(&url).call() {
        Ok(mut resp) => {
            let text = resp
                .body_mut()
                .read_to_string()
                .with_context(|| format!("failed to read {url}"))?;
            Ok(Some(text))
        }
        Err(ureq::Error::StatusCode(404)) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to download {url}")),
    }
}

/// Whether the file at `dest` must be (re-)downloaded.
fn needs_download(name: &str, dest: &Path, expected: Option<&String>) -> bool {
    if !dest.exists() {
        return true;
    }
    let Some(expected) = expected else {
        println!("  {name} already present (no checksum published)");
        return false;
    };
    match livescan_models::sha256_file_hex(dest) {
        Ok(digest) if digest.eq_ignore_ascii_case(expected) => {
            println!("  {name} already present (checksum ok)");
            false
        }
        Ok(_) => {
            println!("  {name} exists but checksum differs, re-downloading");
            true
        }
        Err(_) => {
            println!("  {name} exists but unreadable, re-downloading");
            true
        }
    }
}

/// Download a single artifact with progress output.
fn download_artifact(url: &str, name: &str, dest: &Path, expected: Option<&String>) -> Result<()> {
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp_path = PathBuf::from(tmp_name);

    println!("  downloading {name}...");

    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        // Print progress every 10%
        if let Some(len) = content_length.filter(|&len| len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    if let Some(expected) = expected {
        print!("  verifying checksum... ");
        io::stdout().flush().ok();
        if let Err(e) = livescan_models::verify_file_sha256(name, &tmp_path, expected) {
            fs::remove_file(&tmp_path).ok();
            bail!(e);
        }
        println!("ok");
    }

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

/// Run the fetch command: download any missing or corrupt artifacts from `base_url`.
pub fn run(model_dir: PathBuf, files: &ModelFiles, base_url: &str) -> Result<()> {
    println!("Model directory: {}", model_dir.display());
    println!("Artifact source: {base_url}");

    fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed to create directory {}", model_dir.display()))?;

    let checksums_text = fetch_checksums(base_url)?;
    let checksums: HashMap<String, String> = match &checksums_text {
        Some(text) => livescan_models::parse_checksums(text),
        None => {
            println!("  no {CHECKSUM_FILE} published; downloads will not be verified");
            HashMap::new()
        }
    };

    let mut downloaded = 0;
    let mut skipped = 0;

    for kind in ArtifactKind::ALL {
        let name = files.file_name(kind);
        let dest = files.path(&model_dir, kind);
        let expected = checksums.get(name);

        if !needs_download(name, &dest, expected) {
            skipped += 1;
            continue;
        }

        download_artifact(&artifact_url(base_url, name), name, &dest, expected)?;
        downloaded += 1;
    }

    // Keep the list next to the artifacts so the daemon can re-verify at startup.
    if let Some(text) = checksums_text {
        fs::write(model_dir.join(CHECKSUM_FILE), text)
            .with_context(|| format!("failed to write {CHECKSUM_FILE}"))?;
    }

    println!();
    if downloaded > 0 {
        println!("Fetch complete: {downloaded} artifact(s) downloaded, {skipped} already present.");
    } else {
        println!("All artifacts already present. Nothing to download.");
    }

    Ok(())
}
