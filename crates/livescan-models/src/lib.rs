use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the optional checksum list inside a model directory
/// (`sha256sum` output format: `<hex>  <filename>` per line).
pub const CHECKSUM_FILE: &str = "SHA256SUMS";

/// The three artifacts the liveness ensemble is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Vision-transformer image classifier (ONNX).
    VisionTransformer,
    /// Convolutional image classifier (ONNX).
    ConvNet,
    /// Gradient-boosted-tree meta-learner (XGBoost JSON).
    MetaLearner,
}

impl ArtifactKind {
    /// Load order used by the ensemble.
    pub const ALL: [ArtifactKind; 3] = [Self::VisionTransformer, Self::ConvNet, Self::MetaLearner];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VisionTransformer => "vision_transformer",
            Self::ConvNet => "convnet",
            Self::MetaLearner => "meta_learner",
        }
    }

    /// Environment variable overriding this artifact's filename.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::VisionTransformer => "LIVESCAN_VIT_MODEL",
            Self::ConvNet => "LIVESCAN_CNN_MODEL",
            Self::MetaLearner => "LIVESCAN_META_MODEL",
        }
    }
}

/// Artifact filenames inside the model directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ModelFiles {
    pub vision_transformer: String,
    pub convnet: String,
    pub meta_learner: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            vision_transformer: "swin_transformer_base-07-07-05.onnx".to_string(),
            convnet: "efficientnet_v2_base-07-07-05.onnx".to_string(),
            meta_learner: "xgb_meta_learner-07-07-05.json".to_string(),
        }
    }
}

impl ModelFiles {
    pub fn file_name(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::VisionTransformer => &self.vision_transformer,
            ArtifactKind::ConvNet => &self.convnet,
            ArtifactKind::MetaLearner => &self.meta_learner,
        }
    }

    pub fn path(&self, model_dir: &Path, kind: ArtifactKind) -> PathBuf {
        model_dir.join(self.file_name(kind))
    }

    /// Replace filenames from `LIVESCAN_VIT_MODEL`, `LIVESCAN_CNN_MODEL` and
    /// `LIVESCAN_META_MODEL`, looked up through `env`. Empty values are ignored.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        for kind in ArtifactKind::ALL {
            if let Some(name) = env(kind.env_var()).filter(|name| !name.trim().is_empty()) {
                *self.file_name_mut(kind) = name;
            }
        }
    }

    /// Defaults with the process environment's overrides applied.
    pub fn from_env() -> Self {
        let mut files = Self::default();
        files.apply_env(|key| std::env::var(key).ok());
        files
    }

    fn file_name_mut(&mut self, kind: ArtifactKind) -> &mut String {
        match kind {
            ArtifactKind::VisionTransformer => &mut self.vision_transformer,
            ArtifactKind::ConvNet => &mut self.convnet,
            ArtifactKind::MetaLearner => &mut self.meta_learner,
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// State of one artifact on disk.
#[derive(Debug, Clone)]
pub struct ArtifactReport {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// File size in bytes; `None` when the file is missing.
    pub size: Option<u64>,
    pub sha256: Option<String>,
    /// Checksum from `SHA256SUMS`, if the directory has one listing this file.
    pub expected_sha256: Option<String>,
}

impl ArtifactReport {
    pub fn present(&self) -> bool {
        self.size.is_some()
    }

    /// `None` when there is nothing to compare against.
    pub fn checksum_ok(&self) -> Option<bool> {
        match (&self.sha256, &self.expected_sha256) {
            (Some(got), Some(expected)) => Some(got.eq_ignore_ascii_case(expected)),
            _ => None,
        }
    }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Read `SHA256SUMS` from the model directory, if present.
pub fn read_checksums(model_dir: &Path) -> HashMap<String, String> {
    fs::read_to_string(model_dir.join(CHECKSUM_FILE))
        .map(|contents| parse_checksums(&contents))
        .unwrap_or_default()
}

/// Parse `sha256sum`-style lines into a filename -> lowercase digest map.
///
/// Lines that do not look like `<hex>  <filename>` are skipped. A leading `*`
/// on the filename (binary mode marker) is ignored.
pub fn parse_checksums(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let (digest, name) = line.trim().split_once(char::is_whitespace)?;
            let name = name.trim().trim_start_matches('*');
            if name.is_empty() || digest.len() != 64 {
                return None;
            }
            Some((name.to_string(), digest.to_ascii_lowercase()))
        })
        .collect()
}

/// Check every artifact exists and, where `SHA256SUMS` lists it, matches its checksum.
///
/// Stops at the first problem.
pub fn verify_models_dir(model_dir: &Path, files: &ModelFiles) -> Result<(), ModelIntegrityError> {
    let checksums = read_checksums(model_dir);

    for kind in ArtifactKind::ALL {
        let name = files.file_name(kind);
        let path = files.path(model_dir, kind);
        match checksums.get(name) {
            Some(expected) => verify_file_sha256(name, &path, expected)?,
            None if !path.exists() => {
                return Err(ModelIntegrityError::MissingModel {
                    name: name.to_string(),
                    path,
                })
            }
            None => {}
        }
    }

    Ok(())
}

/// Describe every artifact without failing on missing or unreadable files.
pub fn inspect_models_dir(model_dir: &Path, files: &ModelFiles) -> Vec<ArtifactReport> {
    let checksums = read_checksums(model_dir);

    ArtifactKind::ALL
        .iter()
        .map(|&kind| {
            let path = files.path(model_dir, kind);
            let size = fs::metadata(&path).ok().filter(|m| m.is_file()).map(|m| m.len());
            let sha256 = size.and_then(|_| sha256_file_hex(&path).ok());
            ArtifactReport {
                kind,
                expected_sha256: checksums.get(files.file_name(kind)).cloned(),
                path,
                size,
                sha256,
            }
        })
        .collect()
}
