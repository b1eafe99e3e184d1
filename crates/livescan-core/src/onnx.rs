//! ONNX Runtime backed models: the two image classifiers and, for exported
//! graphs, the meta-learner.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::classifier::{ClassifierError, ImageClassifier, MetaClassifier};
use crate::preprocess::FeatureTensor;
use crate::types::LivenessClass;

/// Compute device used by the ONNX sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// CUDA when compiled in, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    /// CUDA device ordinal.
    Cuda(i32),
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(id) => id
                    .parse()
                    .map(Self::Cuda)
                    .map_err(|_| format!("invalid CUDA device ordinal: {id}")),
                None => Err(format!("unknown device '{s}' (expected auto, cpu, cuda or cuda:N)")),
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Session construction options shared by both image classifiers.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub device: Device,
    pub intra_threads: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            device: Device::Auto,
            intra_threads: 1,
        }
    }
}

fn ort_error(err: impl fmt::Display) -> ClassifierError {
    ClassifierError::Runtime(err.to_string())
}

/// An image classifier graph exported to ONNX with a single image input
/// `(1, 3, 224, 224)` and a single logits output `(1, 3)`.
pub struct OnnxClassifier {
    name: String,
    session: Session,
}

impl OnnxClassifier {
    /// Load an ONNX graph from disk and build an inference session for it.
    pub fn load(
        name: &str,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Self, ClassifierError> {
        let session = build_session(name, path, options)?;
        Ok(Self {
            name: name.to_string(),
            session,
        })
    }
}

/// A gradient-boosted meta-learner exported to ONNX (e.g. `onnxmltools`),
/// taking a `(1, n_features)` float row and producing a `(1, 3)` probability
/// output next to an integer `label` output.
pub struct OnnxMetaClassifier {
    name: String,
    session: Session,
}

impl OnnxMetaClassifier {
    pub fn load(
        name: &str,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Self, ClassifierError> {
        let session = build_session(name, path, options)?;
        Ok(Self {
            name: name.to_string(),
            session,
        })
    }
}

fn build_session(
    name: &str,
    path: &Path,
    options: &SessionOptions,
) -> Result<Session, ClassifierError> {
    if !path.exists() {
        return Err(ClassifierError::MissingModel(path.to_path_buf()));
    }

    let builder = Session::builder()
        .map_err(ort_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort_error)?
        .with_intra_threads(options.intra_threads.max(1))
        .map_err(ort_error)?;
    let builder = register_device(builder, options.device)?;
    let session = builder.commit_from_file(path).map_err(ort_error)?;

    tracing::debug!(
        model = name,
        path = %path.display(),
        device = %options.device,
        threads = options.intra_threads,
        "ONNX session created"
    );
    Ok(session)
}

#[cfg(feature = "cuda")]
fn register_device(
    builder: ort::session::builder::SessionBuilder,
    device: Device,
) -> Result<ort::session::builder::SessionBuilder, ClassifierError> {
    use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};

    let device_id = match device {
        Device::Cpu => return Ok(builder),
        Device::Auto => 0,
        Device::Cuda(id) => id,
    };
    // ONNX Runtime falls back to the CPU provider if CUDA cannot be initialized.
    builder
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .map_err(ort_error)
}

#[cfg(not(feature = "cuda"))]
fn register_device(
    builder: ort::session::builder::SessionBuilder,
    device: Device,
) -> Result<ort::session::builder::SessionBuilder, ClassifierError> {
    if let Device::Cuda(id) = device {
        tracing::warn!(device_id = id, "CUDA requested but not compiled in; using CPU");
    }
    Ok(builder)
}

impl ImageClassifier for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn logits(&mut self, input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let tensor = Tensor::from_array((shape, input.to_vec())).map_err(ort_error)?;

        let outputs = self.session.run(ort::inputs![tensor]).map_err(ort_error)?;
        let Some((_, output)) = outputs.iter().next() else {
            return Err(ClassifierError::MissingOutput);
        };
        let (shape, data) = output.try_extract_tensor::<f32>().map_err(ort_error)?;

        class_scores(shape, data)
    }
}

impl MetaClassifier for OnnxMetaClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict_proba(&mut self, features: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        let shape = vec![1_i64, features.len() as i64];
        let tensor = Tensor::from_array((shape, features.to_vec())).map_err(ort_error)?;

        let outputs = self.session.run(ort::inputs![tensor]).map_err(ort_error)?;

        // Prefer `probabilities`, else the first float tensor that is not the label.
        let mut fallback = None;
        for (name, output) in outputs.iter() {
            if name.contains("label") {
                continue;
            }
            let Ok((shape, data)) = output.try_extract_tensor::<f32>() else {
                continue;
            };
            if name.contains("prob") {
                return class_scores(shape, data);
            }
            if fallback.is_none() {
                fallback = Some(class_scores(shape, data));
            }
        }
        fallback.unwrap_or(Err(ClassifierError::MissingOutput))
    }
}

/// Validate a `(1, 3)` or `(3,)` model output and copy out its values.
fn class_scores(shape: &[i64], data: &[f32]) -> Result<Vec<f32>, ClassifierError> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let classes = match dims.as_slice() {
        [1, n] | [n] => *n,
        _ => 0,
    };
    if classes != LivenessClass::COUNT || data.len() != LivenessClass::COUNT {
        return Err(ClassifierError::OutputShape {
            got: dims,
            expected: LivenessClass::COUNT,
        });
    }
    Ok(data.to_vec())
}
