//! Stub models with fixed outputs, for exercising the pipeline without weights.

use std::time::Duration;

use crate::classifier::{ClassifierError, ImageClassifier, MetaClassifier};
use crate::ensemble::EnsemblePipeline;
use crate::preprocess::FeatureTensor;

/// Image classifier that returns the same logits for every input.
pub struct FixedLogits {
    pub logits: Vec<f32>,
    /// Simulated forward-pass latency.
    pub delay: Duration,
}

impl FixedLogits {
    pub fn new(logits: &[f32]) -> Self {
        Self {
            logits: logits.to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ImageClassifier for FixedLogits {
    fn name(&self) -> &str {
        "fixed-logits"
    }

    fn logits(&mut self, _input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.logits.clone())
    }
}

/// Image classifier whose first forward pass panics; later passes return `logits`.
pub struct PanicsOnce {
    pub logits: Vec<f32>,
    panicked: bool,
}

impl PanicsOnce {
    pub fn new(logits: &[f32]) -> Self {
        Self {
            logits: logits.to_vec(),
            panicked: false,
        }
    }
}

impl ImageClassifier for PanicsOnce {
    fn name(&self) -> &str {
        "panics-once"
    }

    fn logits(&mut self, _input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError> {
        if !self.panicked {
            self.panicked = true;
            panic!("simulated runtime abort in forward pass");
        }
        Ok(self.logits.clone())
    }
}

/// Meta-learner that returns the same probabilities for every feature row.
pub struct FixedProbabilities(pub Vec<f32>);

impl MetaClassifier for FixedProbabilities {
    fn name(&self) -> &str {
        "fixed-probabilities"
    }

    fn predict_proba(&mut self, _features: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        Ok(self.0.clone())
    }
}

/// A ready pipeline whose final output is always `meta_probs`.
pub fn stub_pipeline(meta_probs: &[f32]) -> EnsemblePipeline {
    EnsemblePipeline::from_parts(
        Some(Box::new(FixedLogits::new(&[1.0, 0.0, 0.0]))),
        Some(Box::new(FixedLogits::new(&[0.0, 1.0, 0.0]))),
        Some(Box::new(FixedProbabilities(meta_probs.to_vec()))),
    )
}

/// A pipeline with both image classifiers but no meta-learner.
pub fn pipeline_without_meta_learner() -> EnsemblePipeline {
    EnsemblePipeline::from_parts(
        Some(Box::new(FixedLogits::new(&[1.0, 0.0, 0.0]))),
        Some(Box::new(FixedLogits::new(&[0.0, 1.0, 0.0]))),
        None,
    )
}
