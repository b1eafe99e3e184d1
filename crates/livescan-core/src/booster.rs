//! Gradient-boosted tree meta-learner, evaluated from XGBoost's JSON model format.
//!
//! Only what the meta-learner needs is supported: `gbtree` boosters with
//! numerical splits and the `multi:softprob`, `multi:softmax` and
//! `binary:logistic` objectives.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::classifier::{softmax, ClassifierError, MetaClassifier};

#[derive(Error, Debug)]
pub enum BoosterError {
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported objective '{0}'")]
    UnsupportedObjective(String),
    #[error("unsupported booster '{0}' (only gbtree)")]
    UnsupportedBooster(String),
    #[error("invalid model parameter {name}: '{value}'")]
    InvalidParam { name: &'static str, value: String },
    #[error("tree {tree}: {reason}")]
    InvalidTree { tree: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    /// Per-class margins, softmax over classes.
    MultiSoftprob,
    /// Single margin, logistic link; class 1 is the positive class.
    BinaryLogistic,
}

#[derive(Debug, Clone)]
struct Tree {
    left: Vec<i32>,
    right: Vec<i32>,
    split_index: Vec<u32>,
    split_condition: Vec<f32>,
    default_left: Vec<bool>,
}

impl Tree {
    fn from_json(id: usize, raw: RawTree) -> Result<Self, BoosterError> {
        let n = raw.left_children.len();
        let invalid = |reason: String| BoosterError::InvalidTree { tree: id, reason };

        if n == 0 {
            return Err(invalid("no nodes".into()));
        }
        if raw.right_children.len() != n
            || raw.split_indices.len() != n
            || raw.split_conditions.len() != n
            || raw.default_left.len() != n
        {
            return Err(invalid("node arrays differ in length".into()));
        }
        if raw.split_type.iter().any(|&t| t != 0) {
            return Err(invalid("categorical splits are not supported".into()));
        }
        for (i, (&l, &r)) in raw.left_children.iter().zip(&raw.right_children).enumerate() {
            let is_leaf = l == -1;
            if is_leaf != (r == -1) {
                return Err(invalid(format!("node {i} has exactly one child")));
            }
            // Children always come after their parent, which also rules out cycles.
            let in_range = |c: i32| (c as usize) > i && (c as usize) < n;
            if !is_leaf && !(in_range(l) && in_range(r)) {
                return Err(invalid(format!("node {i} has out-of-range children")));
            }
        }

        Ok(Self {
            left: raw.left_children,
            right: raw.right_children,
            split_index: raw.split_indices,
            split_condition: raw.split_conditions,
            default_left: raw.default_left.into_iter().map(|f| f.0).collect(),
        })
    }

    /// Walk from the root to a leaf and return the leaf value.
    fn leaf_value(&self, features: &[f32]) -> f32 {
        let mut node = 0usize;
        while self.left[node] != -1 {
            let value = features
                .get(self.split_index[node] as usize)
                .copied()
                .unwrap_or(f32::NAN);
            let go_left = if value.is_nan() {
                self.default_left[node]
            } else {
                value < self.split_condition[node]
            };
            node = if go_left {
                self.left[node] as usize
            } else {
                self.right[node] as usize
            };
        }
        self.split_condition[node]
    }
}

/// A loaded XGBoost tree ensemble.
#[derive(Debug, Clone)]
pub struct BoosterModel {
    name: String,
    objective: Objective,
    num_class: usize,
    num_feature: usize,
    base_margin: Vec<f32>,
    trees: Vec<Tree>,
    tree_group: Vec<usize>,
}

impl BoosterModel {
    /// Load a model saved with XGBoost's `save_model("*.json")`.
    pub fn load(name: &str, path: &Path) -> Result<Self, BoosterError> {
        let text = std::fs::read_to_string(path).map_err(|source| BoosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(name, &text)
    }

    pub fn from_json_str(name: &str, json: &str) -> Result<Self, BoosterError> {
        let doc: RawDocument = serde_json::from_str(json)?;
        let learner = doc.learner;

        let objective = match learner.objective.name.as_str() {
            "multi:softprob" | "multi:softmax" => Objective::MultiSoftprob,
            "binary:logistic" => Objective::BinaryLogistic,
            other => return Err(BoosterError::UnsupportedObjective(other.to_string())),
        };
        if learner.gradient_booster.name != "gbtree" {
            return Err(BoosterError::UnsupportedBooster(learner.gradient_booster.name));
        }

        let params = &learner.learner_model_param;
        let num_class = match objective {
            Objective::MultiSoftprob => parse_count("num_class", &params.num_class)?,
            Objective::BinaryLogistic => 2,
        };
        if num_class < 2 {
            return Err(BoosterError::InvalidParam {
                name: "num_class",
                value: params.num_class.clone(),
            });
        }
        let num_feature = parse_count("num_feature", &params.num_feature)?;
        let base_scores = parse_base_score(&params.base_score)?;

        // Margin groups: one per class for softmax objectives, one for logistic.
        let groups = match objective {
            Objective::MultiSoftprob => num_class,
            Objective::BinaryLogistic => 1,
        };
        let base_margin = match (objective, base_scores.as_slice()) {
            (Objective::BinaryLogistic, [p]) => vec![logit(*p)],
            (Objective::MultiSoftprob, [s]) => vec![*s; groups],
            (Objective::MultiSoftprob, scores) if scores.len() == groups => scores.to_vec(),
            _ => {
                return Err(BoosterError::InvalidParam {
                    name: "base_score",
                    value: params.base_score.clone(),
                })
            }
        };

        let model = learner.gradient_booster.model;
        if model.tree_info.len() != model.trees.len() {
            return Err(BoosterError::InvalidParam {
                name: "tree_info",
                value: format!("{} entries for {} trees", model.tree_info.len(), model.trees.len()),
            });
        }
        if let Some(&bad) = model.tree_info.iter().find(|&&g| g >= groups) {
            return Err(BoosterError::InvalidParam {
                name: "tree_info",
                value: bad.to_string(),
            });
        }

        let trees = model
            .trees
            .into_iter()
            .enumerate()
            .map(|(i, raw)| Tree::from_json(i, raw))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            model = name,
            objective = %learner.objective.name,
            trees = trees.len(),
            num_class,
            num_feature,
            "booster parsed"
        );

        Ok(Self {
            name: name.to_string(),
            objective,
            num_class,
            num_feature,
            base_margin,
            trees,
            tree_group: model.tree_info,
        })
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }

    pub fn num_feature(&self) -> usize {
        self.num_feature
    }

    /// Raw per-group margins (before the objective's link function).
    fn margins(&self, features: &[f32]) -> Vec<f32> {
        let mut margins = self.base_margin.clone();
        for (tree, &group) in self.trees.iter().zip(&self.tree_group) {
            margins[group] += tree.leaf_value(features);
        }
        margins
    }
}

impl MetaClassifier for BoosterModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict_proba(&mut self, features: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        if features.len() != self.num_feature {
            return Err(ClassifierError::FeatureCount {
                expected: self.num_feature,
                got: features.len(),
            });
        }

        let margins = self.margins(features);
        let probs = match self.objective {
            Objective::MultiSoftprob => softmax(&margins),
            Objective::BinaryLogistic => {
                let p = sigmoid(margins[0]);
                vec![1.0 - p, p]
            }
        };

        if probs.iter().any(|p| !p.is_finite()) {
            return Err(ClassifierError::NonFinite);
        }
        Ok(probs)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}

fn parse_count(name: &'static str, value: &str) -> Result<usize, BoosterError> {
    value.trim().parse().map_err(|_| BoosterError::InvalidParam {
        name,
        value: value.to_string(),
    })
}

/// `base_score` is a scalar string ("5E-1") in older models and a bracketed
/// vector ("[3.3333334E-1,3.3333334E-1]") in newer ones.
fn parse_base_score(value: &str) -> Result<Vec<f32>, BoosterError> {
    let invalid = || BoosterError::InvalidParam {
        name: "base_score",
        value: value.to_string(),
    };
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    let scores = inner
        .split(',')
        .map(|s| s.trim().parse::<f32>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if scores.is_empty() || scores.iter().any(|s| !s.is_finite()) {
        return Err(invalid());
    }
    Ok(scores)
}

// --- XGBoost JSON schema (subset) ---

#[derive(Deserialize)]
struct RawDocument {
    learner: RawLearner,
}

#[derive(Deserialize)]
struct RawLearner {
    gradient_booster: RawGradientBooster,
    learner_model_param: RawLearnerParam,
    objective: RawObjective,
}

#[derive(Deserialize)]
struct RawLearnerParam {
    #[serde(default = "default_base_score")]
    base_score: String,
    #[serde(default = "default_num_class")]
    num_class: String,
    num_feature: String,
}

fn default_base_score() -> String {
    "5E-1".to_string()
}

fn default_num_class() -> String {
    "0".to_string()
}

#[derive(Deserialize)]
struct RawObjective {
    name: String,
}

#[derive(Deserialize)]
struct RawGradientBooster {
    name: String,
    model: RawGbtreeModel,
}

#[derive(Deserialize)]
struct RawGbtreeModel {
    trees: Vec<RawTree>,
    tree_info: Vec<usize>,
}

#[derive(Deserialize)]
struct RawTree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<u32>,
    split_conditions: Vec<f32>,
    default_left: Vec<Flag>,
    #[serde(default)]
    split_type: Vec<u8>,
}

/// XGBoost writes boolean node flags as `0`/`1` (or `true`/`false` in some versions).
struct Flag(bool);

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Int(u8),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bool(b) => Flag(b),
            Repr::Int(i) => Flag(i != 0),
        })
    }
}
