use crate::models::FaceModelKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Location of a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for the ArcFace family).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding. Embeddings from different models
    /// live in unrelated vector spaces and are never compared.
    pub model: FaceModelKind,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions; no early exit.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Identifier for a registered person, minted by the gate at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub Uuid);

impl PersonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One person's stored biometric record.
///
/// Created exactly once when a registration commits and never mutated
/// afterwards; removal happens only when the owning person is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiometricRecord {
    pub person: PersonId,
    pub embedding: Embedding,
    /// SHA-256 hex digest of the original photo held in the vault.
    pub artifact_sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Verdict of a corpus scan.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// No stored record met the threshold.
    NoMatch,
    /// Best record at or above the threshold.
    Match { person: PersonId, similarity: f32 },
}

/// Result of scanning the corpus for a probe embedding.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub outcome: MatchOutcome,
    /// Best similarity observed among compared records (0.0 if none compared).
    pub best_similarity: f32,
    /// Number of records actually compared.
    pub compared: usize,
    /// Records skipped because they were embedded under a different model
    /// than the probe.
    pub skipped_foreign: usize,
}

/// Strategy for comparing a probe embedding against the stored corpus.
pub trait Matcher {
    fn find_match(
        &self,
        probe: &Embedding,
        corpus: &[BiometricRecord],
        threshold: f32,
    ) -> ScanResult;
}

/// Cosine similarity matcher.
///
/// Always scans the full corpus regardless of where the best match sits, so
/// two scans over the same records take the same path. Ties keep the earliest
/// record in enumeration order. Records embedded under a different model than
/// the probe are skipped and tallied, never compared.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_match(
        &self,
        probe: &Embedding,
        corpus: &[BiometricRecord],
        threshold: f32,
    ) -> ScanResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&BiometricRecord> = None;
        let mut compared = 0usize;
        let mut skipped_foreign = 0usize;

        // Full scan, no early exit.
        for record in corpus {
            if record.embedding.model != probe.model {
                skipped_foreign += 1;
                continue;
            }
            compared += 1;
            let sim = probe.similarity(&record.embedding);
            if sim > best_sim {
                best_sim = sim;
                best = Some(record);
            }
        }

        let outcome = match best {
            Some(record) if best_sim >= threshold => MatchOutcome::Match {
                person: record.person,
                similarity: best_sim,
            },
            _ => MatchOutcome::NoMatch,
        };

        ScanResult {
            outcome,
            best_similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
            compared,
            skipped_foreign,
        }
    }
}
