use serde::{Deserialize, Serialize};

/// Output classes of the liveness ensemble, in model index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessClass {
    /// A live subject in front of the camera.
    Real,
    /// A face shown on a screen (video or photo replay).
    Replay,
    /// A printed photograph.
    Print,
}

impl LivenessClass {
    /// All classes, indexed the way the models emit them.
    pub const ALL: [LivenessClass; 3] = [Self::Real, Self::Replay, Self::Print];

    /// Number of output classes.
    pub const COUNT: usize = Self::ALL.len();

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        match self {
            Self::Real => 0,
            Self::Replay => 1,
            Self::Print => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Replay => "replay",
            Self::Print => "print",
        }
    }
}

impl std::fmt::Display for LivenessClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final ensemble decision for one frame.
///
/// Serializes as `{"className": "real", "confidence": 0.97}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "className")]
    pub class: LivenessClass,
    /// Meta-learner probability of `class`, in `[0, 1]`.
    pub confidence: f32,
}
