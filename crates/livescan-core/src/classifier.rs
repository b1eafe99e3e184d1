//! Capability interfaces for the models behind the ensemble.
//!
//! The pipeline only ever talks to these traits, so the ONNX and XGBoost
//! backends can be swapped for deterministic stubs in tests.

use thiserror::Error;

use crate::preprocess::FeatureTensor;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    MissingModel(std::path::PathBuf),
    #[error("inference runtime error: {0}")]
    Runtime(String),
    #[error("unexpected output shape {got:?} (expected {expected} classes)")]
    OutputShape { got: Vec<usize>, expected: usize },
    #[error("expected {expected} features, got {got}")]
    FeatureCount { expected: usize, got: usize },
    #[error("non-finite value in model output")]
    NonFinite,
    #[error("model produced no usable float output")]
    MissingOutput,
}

/// Image classifier producing raw (pre-softmax) class scores.
pub trait ImageClassifier: Send {
    fn name(&self) -> &str;

    /// Run a forward pass in inference mode and return one logit per class.
    fn logits(&mut self, input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError>;
}

/// Meta-learner mapping a flat feature row to class probabilities.
pub trait MetaClassifier: Send {
    fn name(&self) -> &str;

    fn predict_proba(&mut self, features: &[f32]) -> Result<Vec<f32>, ClassifierError>;
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Index of the largest value; the first occurrence wins ties and NaN never wins.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
