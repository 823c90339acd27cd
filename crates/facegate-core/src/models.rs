//! The fixed set of supported recognition models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("unknown face model \"{0}\" (expected one of: arcface-r50, arcface-r100, mobilefacenet)")]
pub struct UnknownModel(pub String);

/// Recognition models shipped with the gate.
///
/// All are InsightFace ArcFace-family ONNX exports producing 512-dimensional
/// embeddings. Embeddings from different models live in unrelated vector
/// spaces and must never be compared against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceModelKind {
    /// ResNet-50 backbone (w600k_r50). The default.
    ArcFaceR50,
    /// ResNet-100 backbone (w600k_r100). Slower, tighter score spread.
    ArcFaceR100,
    /// MobileFaceNet backbone (w600k_mbf). For constrained hosts.
    MobileFaceNet,
}

impl FaceModelKind {
    pub const ALL: [FaceModelKind; 3] = [
        FaceModelKind::ArcFaceR50,
        FaceModelKind::ArcFaceR100,
        FaceModelKind::MobileFaceNet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaceModelKind::ArcFaceR50 => "arcface-r50",
            FaceModelKind::ArcFaceR100 => "arcface-r100",
            FaceModelKind::MobileFaceNet => "mobilefacenet",
        }
    }

    /// ONNX file name inside the model directory.
    pub fn model_file(&self) -> &'static str {
        match self {
            FaceModelKind::ArcFaceR50 => "w600k_r50.onnx",
            FaceModelKind::ArcFaceR100 => "w600k_r100.onnx",
            FaceModelKind::MobileFaceNet => "w600k_mbf.onnx",
        }
    }

    pub fn embedding_dim(&self) -> usize {
        512
    }

    /// Built-in cosine similarity threshold for a duplicate verdict.
    ///
    /// Per-model because the score distributions differ: the larger backbones
    /// separate genuine/impostor pairs more sharply.
    pub fn default_threshold(&self) -> f32 {
        match self {
            FaceModelKind::ArcFaceR50 => 0.40,
            FaceModelKind::ArcFaceR100 => 0.36,
            FaceModelKind::MobileFaceNet => 0.45,
        }
    }
}

impl Default for FaceModelKind {
    fn default() -> Self {
        FaceModelKind::ArcFaceR50
    }
}

impl fmt::Display for FaceModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaceModelKind {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arcface-r50" => Ok(FaceModelKind::ArcFaceR50),
            "arcface-r100" => Ok(FaceModelKind::ArcFaceR100),
            "mobilefacenet" => Ok(FaceModelKind::MobileFaceNet),
            other => Err(UnknownModel(other.to_string())),
        }
    }
}
