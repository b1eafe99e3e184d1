//! Stacked liveness ensemble: two image classifiers feeding a boosted meta-learner.

use std::path::Path;

use image::RgbImage;
use thiserror::Error;

pub use livescan_models::{ArtifactKind, ModelFiles};

use crate::booster::BoosterModel;
use crate::classifier::{argmax, softmax, ClassifierError, ImageClassifier, MetaClassifier};
use crate::onnx::{OnnxClassifier, OnnxMetaClassifier, SessionOptions};
use crate::preprocess::{preprocess, FeatureTensor};
use crate::types::{LivenessClass, Prediction};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("ensemble unavailable: missing {0:?}")]
    Unavailable(Vec<&'static str>),
    #[error("{model} failed: {source}")]
    Classifier {
        model: String,
        #[source]
        source: ClassifierError,
    },
    #[error("{model} returned {got} values (expected {expected})")]
    OutputLength {
        model: String,
        got: usize,
        expected: usize,
    },
    #[error("{model} returned an invalid probability")]
    InvalidProbability { model: String },
}

/// Which of the three models loaded successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ModelAvailability {
    pub vision_transformer: bool,
    pub convnet: bool,
    pub meta_learner: bool,
}

impl ModelAvailability {
    pub fn all(&self) -> bool {
        self.vision_transformer && self.convnet && self.meta_learner
    }

    pub fn missing(&self) -> Vec<&'static str> {
        [
            (ArtifactKind::VisionTransformer, self.vision_transformer),
            (ArtifactKind::ConvNet, self.convnet),
            (ArtifactKind::MetaLearner, self.meta_learner),
        ]
        .into_iter()
        .filter(|(_, loaded)| !loaded)
        .map(|(kind, _)| kind.as_str())
        .collect()
    }
}

/// Owns the three models for the process lifetime and turns frames into predictions.
///
/// Construction always succeeds; models that fail to load are recorded as
/// unavailable and every prediction then yields `None`.
pub struct EnsemblePipeline {
    vision_transformer: Option<Box<dyn ImageClassifier>>,
    convnet: Option<Box<dyn ImageClassifier>>,
    meta_learner: Option<Box<dyn MetaClassifier>>,
}

impl EnsemblePipeline {
    /// Load the vision transformer, the convolutional network and the
    /// meta-learner from `model_dir`, in that order.
    pub fn load(model_dir: &Path, files: &ModelFiles, options: &SessionOptions) -> Self {
        tracing::info!(
            model_dir = %model_dir.display(),
            device = %options.device,
            "initializing liveness ensemble"
        );

        let vision_transformer = load_image_classifier(
            ArtifactKind::VisionTransformer,
            &files.path(model_dir, ArtifactKind::VisionTransformer),
            options,
        );
        let convnet = load_image_classifier(
            ArtifactKind::ConvNet,
            &files.path(model_dir, ArtifactKind::ConvNet),
            options,
        );

        let meta_learner = load_meta_learner(
            &files.path(model_dir, ArtifactKind::MetaLearner),
            options,
        );

        let pipeline = Self::from_parts(vision_transformer, convnet, meta_learner);
        let availability = pipeline.availability();
        if availability.all() {
            tracing::info!("liveness ensemble ready");
        } else {
            tracing::warn!(
                missing = ?availability.missing(),
                "liveness ensemble started without all models; predictions disabled"
            );
        }
        pipeline
    }

    /// Assemble a pipeline from already-constructed models.
    pub fn from_parts(
        vision_transformer: Option<Box<dyn ImageClassifier>>,
        convnet: Option<Box<dyn ImageClassifier>>,
        meta_learner: Option<Box<dyn MetaClassifier>>,
    ) -> Self {
        Self {
            vision_transformer,
            convnet,
            meta_learner,
        }
    }

    pub fn availability(&self) -> ModelAvailability {
        ModelAvailability {
            vision_transformer: self.vision_transformer.is_some(),
            convnet: self.convnet.is_some(),
            meta_learner: self.meta_learner.is_some(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.availability().all()
    }

    /// Classify one frame. Returns `None` when any model is unavailable or
    /// when inference fails; failures are logged, never propagated.
    pub fn predict(&mut self, image: &RgbImage) -> Option<Prediction> {
        match self.try_predict(image) {
            Ok(prediction) => Some(prediction),
            Err(PipelineError::Unavailable(missing)) => {
                tracing::warn!(?missing, "prediction skipped: ensemble unavailable");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "prediction failed");
                None
            }
        }
    }

    /// Classify one frame, reporting why no prediction could be made.
    pub fn try_predict(&mut self, image: &RgbImage) -> Result<Prediction, PipelineError> {
        let availability = self.availability();
        let (Some(vit), Some(cnn), Some(meta)) = (
            self.vision_transformer.as_mut(),
            self.convnet.as_mut(),
            self.meta_learner.as_mut(),
        ) else {
            return Err(PipelineError::Unavailable(availability.missing()));
        };

        let input = preprocess(image);

        let mut meta_features = Vec::with_capacity(2 * LivenessClass::COUNT);
        meta_features.extend(class_probabilities(&mut **vit, &input)?);
        meta_features.extend(class_probabilities(&mut **cnn, &input)?);

        let probs = meta
            .predict_proba(&meta_features)
            .map_err(|source| PipelineError::Classifier {
                model: meta.name().to_string(),
                source,
            })?;
        if probs.len() != LivenessClass::COUNT {
            return Err(PipelineError::OutputLength {
                model: meta.name().to_string(),
                got: probs.len(),
                expected: LivenessClass::COUNT,
            });
        }
        if probs.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(PipelineError::InvalidProbability {
                model: meta.name().to_string(),
            });
        }

        let class = argmax(&probs)
            .and_then(LivenessClass::from_index)
            .ok_or_else(|| PipelineError::InvalidProbability {
                model: meta.name().to_string(),
            })?;
        let prediction = Prediction {
            class,
            confidence: probs[class.index()],
        };

        tracing::debug!(
            class = %prediction.class,
            confidence = prediction.confidence,
            meta_features = ?meta_features,
            "ensemble prediction"
        );
        Ok(prediction)
    }
}

fn load_image_classifier(
    kind: ArtifactKind,
    path: &Path,
    options: &SessionOptions,
) -> Option<Box<dyn ImageClassifier>> {
    match OnnxClassifier::load(kind.as_str(), path, options) {
        Ok(model) => {
            tracing::info!(model = kind.as_str(), path = %path.display(), "classifier loaded");
            Some(Box::new(model) as Box<dyn ImageClassifier>)
        }
        Err(e) => {
            tracing::error!(
                model = kind.as_str(),
                path = %path.display(),
                error = %e,
                "classifier unavailable"
            );
            None
        }
    }
}

/// On-disk encodings accepted for the meta-learner artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFormat {
    /// XGBoost's native JSON model dump, evaluated in-process.
    XgboostJson,
    /// A graph exported to ONNX, run through ONNX Runtime.
    Onnx,
}

impl MetaFormat {
    /// Chosen by file extension; anything other than `.onnx` is read as XGBoost JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("onnx") => Self::Onnx,
            _ => Self::XgboostJson,
        }
    }
}

fn load_meta_learner(path: &Path, options: &SessionOptions) -> Option<Box<dyn MetaClassifier>> {
    let name = ArtifactKind::MetaLearner.as_str();
    let format = MetaFormat::from_path(path);
    let loaded = match format {
        MetaFormat::XgboostJson => BoosterModel::load(name, path)
            .map(|model| {
                tracing::debug!(
                    classes = model.num_class(),
                    features = model.num_feature(),
                    "booster parsed"
                );
                Box::new(model) as Box<dyn MetaClassifier>
            })
            .map_err(|e| e.to_string()),
        MetaFormat::Onnx => OnnxMetaClassifier::load(name, path, options)
            .map(|model| Box::new(model) as Box<dyn MetaClassifier>)
            .map_err(|e| e.to_string()),
    };

    match loaded {
        Ok(model) => {
            tracing::info!(path = %path.display(), ?format, "meta-learner loaded");
            Some(model)
        }
        Err(error) => {
            tracing::error!(path = %path.display(), ?format, %error, "meta-learner unavailable");
            None
        }
    }
}

/// Forward pass plus softmax for one image classifier.
fn class_probabilities(
    classifier: &mut dyn ImageClassifier,
    input: &FeatureTensor,
) -> Result<Vec<f32>, PipelineError> {
    let logits = classifier
        .logits(input)
        .map_err(|source| PipelineError::Classifier {
            model: classifier.name().to_string(),
            source,
        })?;
    if logits.len() != LivenessClass::COUNT {
        return Err(PipelineError::OutputLength {
            model: classifier.name().to_string(),
            got: logits.len(),
            expected: LivenessClass::COUNT,
        });
    }
    let probs = softmax(&logits);
    if probs.iter().any(|p| !p.is_finite()) {
        return Err(PipelineError::InvalidProbability {
            model: classifier.name().to_string(),
        });
    }
    Ok(probs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Image classifier that always returns the same logits.
    struct FixedLogits {
        name: &'static str,
        logits: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl FixedLogits {
        fn boxed(name: &'static str, logits: &[f32]) -> Box<dyn ImageClassifier> {
            Box::new(Self {
                name,
                logits: logits.to_vec(),
                calls: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    impl ImageClassifier for FixedLogits {
        fn name(&self) -> &str {
            self.name
        }

        fn logits(&mut self, input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError> {
            assert_eq!(input.shape(), &[1, 3, 224, 224]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.logits.clone())
        }
    }

    struct Failing;

    impl ImageClassifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn logits(&mut self, _input: &FeatureTensor) -> Result<Vec<f32>, ClassifierError> {
            Err(ClassifierError::Runtime("device lost".into()))
        }
    }

    /// Meta-learner returning fixed probabilities and recording its input.
    struct FixedMeta {
        probs: Vec<f32>,
        seen: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl FixedMeta {
        fn boxed(probs: &[f32]) -> (Box<dyn MetaClassifier>, Arc<Mutex<Vec<Vec<f32>>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let meta = Self {
                probs: probs.to_vec(),
                seen: seen.clone(),
            };
            (Box::new(meta), seen)
        }
    }

    impl MetaClassifier for FixedMeta {
        fn name(&self) -> &str {
            "fixed-meta"
        }

        fn predict_proba(&mut self, features: &[f32]) -> Result<Vec<f32>, ClassifierError> {
            self.seen.lock().unwrap().push(features.to_vec());
            Ok(self.probs.clone())
        }
    }

    fn solid_frame() -> RgbImage {
        RgbImage::from_pixel(224, 224, Rgb([90, 120, 200]))
    }

    #[test]
    fn test_prediction_is_meta_argmax() {
        let (meta, _) = FixedMeta::boxed(&[0.1, 0.2, 0.7]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[2.0, 0.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[0.0, 0.0, 2.0])),
            Some(meta),
        );
        assert!(pipeline.is_ready());

        let prediction = pipeline.predict(&solid_frame()).unwrap();
        assert_eq!(prediction.class, LivenessClass::Print);
        assert!((prediction.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_meta_features_concatenate_vit_then_cnn() {
        let (meta, seen) = FixedMeta::boxed(&[0.6, 0.3, 0.1]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[1.0, 2.0, 3.0])),
            Some(FixedLogits::boxed("cnn", &[0.0, 0.0, 0.0])),
            Some(meta),
        );
        pipeline.predict(&solid_frame()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let features = &seen[0];
        assert_eq!(features.len(), 6);
        let vit = softmax(&[1.0, 2.0, 3.0]);
        for i in 0..3 {
            assert!((features[i] - vit[i]).abs() < 1e-6);
            assert!((features[3 + i] - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tie_goes_to_lowest_index() {
        let (meta, _) = FixedMeta::boxed(&[0.2, 0.4, 0.4]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[0.0, 0.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[0.0, 0.0, 0.0])),
            Some(meta),
        );
        let prediction = pipeline.predict(&solid_frame()).unwrap();
        assert_eq!(prediction.class, LivenessClass::Replay);
    }

    #[test]
    fn test_missing_meta_learner_yields_none() {
        let vit_calls = Arc::new(AtomicUsize::new(0));
        let vit = FixedLogits {
            name: "vit",
            logits: vec![1.0, 0.0, 0.0],
            calls: vit_calls.clone(),
        };
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(Box::new(vit)),
            Some(FixedLogits::boxed("cnn", &[1.0, 0.0, 0.0])),
            None,
        );
        assert!(!pipeline.is_ready());
        assert_eq!(pipeline.availability().missing(), vec!["meta_learner"]);

        for _ in 0..3 {
            assert!(pipeline.predict(&solid_frame()).is_none());
        }
        assert!(matches!(
            pipeline.try_predict(&solid_frame()),
            Err(PipelineError::Unavailable(_))
        ));
        // No partial inference when the ensemble is incomplete.
        assert_eq!(vit_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_classifier_yields_none() {
        let (meta, seen) = FixedMeta::boxed(&[1.0, 0.0, 0.0]);
        let mut pipeline = EnsemblePipeline::from_parts(
            None,
            Some(FixedLogits::boxed("cnn", &[1.0, 0.0, 0.0])),
            Some(meta),
        );
        assert!(pipeline.predict(&solid_frame()).is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_classifier_failure_yields_none() {
        let (meta, _) = FixedMeta::boxed(&[1.0, 0.0, 0.0]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[1.0, 0.0, 0.0])),
            Some(Box::new(Failing)),
            Some(meta),
        );
        assert!(pipeline.predict(&solid_frame()).is_none());
        assert!(matches!(
            pipeline.try_predict(&solid_frame()),
            Err(PipelineError::Classifier { .. })
        ));
    }

    #[test]
    fn test_wrong_output_length_yields_none() {
        let (meta, _) = FixedMeta::boxed(&[0.5, 0.5]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[1.0, 0.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[1.0, 0.0, 0.0])),
            Some(meta),
        );
        assert!(matches!(
            pipeline.try_predict(&solid_frame()),
            Err(PipelineError::OutputLength { got: 2, .. })
        ));

        let (meta, _) = FixedMeta::boxed(&[0.2, 0.3, 0.5]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[1.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[1.0, 0.0, 0.0])),
            Some(meta),
        );
        assert!(pipeline.predict(&solid_frame()).is_none());
    }

    #[test]
    fn test_out_of_range_probability_yields_none() {
        let (meta, _) = FixedMeta::boxed(&[1.5, -0.5, 0.0]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[1.0, 0.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[1.0, 0.0, 0.0])),
            Some(meta),
        );
        assert!(pipeline.predict(&solid_frame()).is_none());
    }

    #[test]
    fn test_repeated_predictions_identical() {
        let (meta, _) = FixedMeta::boxed(&[0.3, 0.6, 0.1]);
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[0.3, 0.1, 0.2])),
            Some(FixedLogits::boxed("cnn", &[0.5, 0.9, 0.1])),
            Some(meta),
        );
        let frame = RgbImage::from_fn(320, 240, |x, y| Rgb([x as u8, y as u8, 42]));
        let first = pipeline.predict(&frame).unwrap();
        for _ in 0..5 {
            assert_eq!(pipeline.predict(&frame).unwrap(), first);
        }
    }

    #[test]
    fn test_real_booster_meta_learner() {
        // Softprob stumps: class 0 wins when the ViT is confident in class 0 (f0 >= 0.5).
        let json = r#"{
          "learner": {
            "gradient_booster": {
              "name": "gbtree",
              "model": {
                "tree_info": [0, 1, 2],
                "trees": [
                  { "left_children": [1, -1, -1], "right_children": [2, -1, -1],
                    "split_indices": [0, 0, 0], "split_conditions": [0.5, -1.0, 3.0],
                    "default_left": [0, 0, 0] },
                  { "left_children": [-1], "right_children": [-1],
                    "split_indices": [0], "split_conditions": [0.0], "default_left": [0] },
                  { "left_children": [-1], "right_children": [-1],
                    "split_indices": [0], "split_conditions": [0.0], "default_left": [0] }
                ]
              }
            },
            "learner_model_param": { "base_score": "5E-1", "num_class": "3", "num_feature": "6" },
            "objective": { "name": "multi:softprob" }
          }
        }"#;
        let booster = BoosterModel::from_json_str("meta", json).unwrap();
        let mut pipeline = EnsemblePipeline::from_parts(
            Some(FixedLogits::boxed("vit", &[5.0, 0.0, 0.0])),
            Some(FixedLogits::boxed("cnn", &[0.0, 0.0, 0.0])),
            Some(Box::new(booster)),
        );
        let prediction = pipeline.predict(&solid_frame()).unwrap();
        assert_eq!(prediction.class, LivenessClass::Real);
        let expected = softmax(&[3.5, 0.5, 0.5])[0];
        assert!((prediction.confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn test_load_from_empty_dir_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline =
            EnsemblePipeline::load(dir.path(), &ModelFiles::default(), &SessionOptions::default());
        assert_eq!(
            pipeline.availability(),
            ModelAvailability {
                vision_transformer: false,
                convnet: false,
                meta_learner: false,
            }
        );
        assert!(pipeline.predict(&solid_frame()).is_none());
    }

    #[test]
    fn test_load_with_only_meta_learner_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles::default();
        std::fs::write(
            files.path(dir.path(), ArtifactKind::MetaLearner),
            r#"{"learner": {
                "gradient_booster": {"name": "gbtree", "model": {"tree_info": [], "trees": []}},
                "learner_model_param": {"base_score": "5E-1", "num_class": "3", "num_feature": "6"},
                "objective": {"name": "multi:softprob"}}}"#,
        )
        .unwrap();

        let mut pipeline = EnsemblePipeline::load(dir.path(), &files, &SessionOptions::default());
        let availability = pipeline.availability();
        assert!(availability.meta_learner);
        assert!(!availability.vision_transformer && !availability.convnet);
        assert!(pipeline.predict(&solid_frame()).is_none());
    }

    #[test]
    fn test_meta_format_follows_extension() {
        assert_eq!(MetaFormat::from_path(Path::new("m/xgb.onnx")), MetaFormat::Onnx);
        assert_eq!(MetaFormat::from_path(Path::new("m/XGB.ONNX")), MetaFormat::Onnx);
        assert_eq!(
            MetaFormat::from_path(Path::new("m/xgb_meta_learner-07-07-05.json")),
            MetaFormat::XgboostJson
        );
        assert_eq!(MetaFormat::from_path(Path::new("m/xgb")), MetaFormat::XgboostJson);
    }

    #[test]
    fn test_onnx_meta_learner_path_is_used_for_onnx_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles {
            meta_learner: "xgb_meta_learner.onnx".to_string(),
            ..ModelFiles::default()
        };
        // Valid XGBoost JSON under an .onnx name must not be parsed as JSON.
        std::fs::write(
            files.path(dir.path(), ArtifactKind::MetaLearner),
            r#"{"learner": {
                "gradient_booster": {"name": "gbtree", "model": {"tree_info": [], "trees": []}},
                "learner_model_param": {"base_score": "5E-1", "num_class": "3", "num_feature": "6"},
                "objective": {"name": "multi:softprob"}}}"#,
        )
        .unwrap();

        let pipeline = EnsemblePipeline::load(dir.path(), &files, &SessionOptions::default());
        assert!(!pipeline.availability().meta_learner);
    }
}
