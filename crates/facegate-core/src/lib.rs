//! facegate-core: face detection and embedding extraction.
//!
//! Uses SCRFD for face detection and the ArcFace model family for
//! embeddings, both running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod models;
pub mod pipeline;
pub mod types;

pub use frame::{PhotoError, PhotoFrame};
pub use models::{FaceModelKind, UnknownModel};
pub use pipeline::{ExtractError, FacePipeline};
pub use types::{
    BiometricRecord, CosineMatcher, DetectedFace, Embedding, MatchOutcome, Matcher, PersonId,
    ScanResult,
};
