//! ArcFace-family face encoder via ONNX Runtime.
//!
//! Extracts L2-normalized face embeddings from aligned face crops for any
//! of the supported recognition models.

use crate::alignment;
use crate::frame::PhotoFrame;
use crate::models::FaceModelKind;
use crate::types::{DetectedFace, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face encoder for one recognition model.
#[derive(Debug)]
pub struct FaceEncoder {
    session: Session,
    kind: FaceModelKind,
}

impl FaceEncoder {
    /// Load the ONNX model for `kind` from the given path.
    pub fn load(model_path: &str, kind: FaceModelKind) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            model = %kind,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self { session, kind })
    }

    /// Extract a face embedding for a detected face in a decoded photo.
    ///
    /// The face must have landmarks (from the SCRFD detector). The face is
    /// aligned to a canonical 112x112 position before embedding extraction,
    /// and the output is L2-normalized and tagged with the model kind.
    pub fn extract(
        &mut self,
        photo: &PhotoFrame,
        face: &DetectedFace,
    ) -> Result<Embedding, EncoderError> {
        let landmarks = face.landmarks.as_ref().ok_or(EncoderError::NoLandmarks)?;

        // Align face to canonical 112x112 position
        let aligned = alignment::align_face(photo, landmarks);

        // Preprocess aligned crop
        let input = Self::preprocess(&aligned);

        // Run inference
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        let expected_dim = self.kind.embedding_dim();
        if raw.len() != expected_dim {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {expected_dim}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize the embedding
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding { values, model: self.kind })
    }

    /// Preprocess a 112x112 aligned RGB crop into a NCHW float tensor.
    ///
    /// Channel planes are written in BGR order, as the InsightFace exports
    /// expect.
    fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * 3;
                let r = aligned_face.get(base).copied().unwrap_or(0) as f32;
                let g = aligned_face.get(base + 1).copied().unwrap_or(0) as f32;
                let b = aligned_face.get(base + 2).copied().unwrap_or(0) as f32;

                tensor[[0, 0, y, x]] = (b - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 1, y, x]] = (g - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 2, y, x]] = (r - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}
