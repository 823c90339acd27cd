//! End-to-end extraction: decode, detect, align, encode.

use crate::detector::{DetectorError, FaceDetector};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::frame::{PhotoError, PhotoFrame};
use crate::models::FaceModelKind;
use crate::types::Embedding;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// ONNX file name of the SCRFD detector inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("decode: {0}")]
    Decode(#[from] PhotoError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

impl ExtractError {
    /// Whether the failure is the submitter's fault (unusable photo) rather
    /// than an infrastructure fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, ExtractError::Decode(_) | ExtractError::NoFaceDetected)
    }
}

/// Face extraction pipeline owning the detector and per-model encoders.
///
/// The detector loads eagerly so a missing model file fails at startup;
/// encoder sessions load lazily on first use of each model kind and stay
/// cached for the lifetime of the pipeline.
#[derive(Debug)]
pub struct FacePipeline {
    detector: FaceDetector,
    encoders: HashMap<FaceModelKind, FaceEncoder>,
    model_dir: PathBuf,
}

impl FacePipeline {
    /// Open the pipeline against a directory of ONNX model files.
    pub fn open(model_dir: &Path) -> Result<Self, ExtractError> {
        let det_path = model_dir.join(DETECTOR_MODEL_FILE);
        let detector = FaceDetector::load(&det_path.to_string_lossy())?;

        Ok(Self {
            detector,
            encoders: HashMap::new(),
            model_dir: model_dir.to_path_buf(),
        })
    }

    /// Extract an embedding from raw uploaded image bytes under the given
    /// recognition model.
    ///
    /// Registration photos are expected to contain one face; when several are
    /// present the highest-confidence detection wins.
    pub fn extract(
        &mut self,
        image: &[u8],
        kind: FaceModelKind,
    ) -> Result<Embedding, ExtractError> {
        let photo = PhotoFrame::decode(image)?;
        let faces = self.detector.detect(&photo)?;

        let face = faces.first().cloned().ok_or(ExtractError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(
                count = faces.len(),
                confidence = face.confidence,
                "multiple faces in photo; using the most confident"
            );
        }

        let encoder = match self.encoders.entry(kind) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let path = self.model_dir.join(kind.model_file());
                v.insert(FaceEncoder::load(&path.to_string_lossy(), kind)?)
            }
        };

        let embedding = encoder.extract(&photo, &face)?;
        tracing::debug!(
            model = %kind,
            dim = embedding.values.len(),
            confidence = face.confidence,
            "embedding extracted"
        );
        Ok(embedding)
    }
}
