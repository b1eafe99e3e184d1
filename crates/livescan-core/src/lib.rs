//! livescan-core: Face-liveness ensemble engine.
//!
//! Two image classifiers (a vision transformer and a convolutional network,
//! both run through ONNX Runtime) score a frame independently; their softmax
//! outputs feed a gradient-boosted-tree meta-learner that makes the final
//! `real` / `replay` / `print` call.

pub mod booster;
pub mod classifier;
pub mod decode;
pub mod ensemble;
pub mod onnx;
pub mod preprocess;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod types;

pub use booster::BoosterModel;
pub use classifier::{ImageClassifier, MetaClassifier};
pub use decode::{decode_base64_image, decode_image_bytes, DecodeError};
pub use ensemble::{EnsemblePipeline, MetaFormat, ModelAvailability, ModelFiles, PipelineError};
pub use onnx::{Device, OnnxClassifier, OnnxMetaClassifier, SessionOptions};
pub use preprocess::{preprocess, FeatureTensor};
pub use types::{LivenessClass, Prediction};

use std::path::PathBuf;

/// Determine the default model directory.
///
/// When running as root (UID 0), defaults to `/var/lib/livescan/models` (system-wide).
/// Otherwise defaults to `$XDG_DATA_HOME/livescan/models` (~/.local/share/livescan/models).
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/livescan/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("livescan/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}
