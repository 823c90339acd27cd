//! Process-wide match policy registry.
//!
//! A single mutable (model, threshold) pair that every registration snapshots
//! at the start of its matching phase. Updates apply to future matches only;
//! the committed corpus is never re-evaluated.

use facegate_core::FaceModelKind;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("threshold {0} out of range; expected a value in (0, 1], or 0 to reset to the model default")]
    ThresholdOutOfRange(f32),
}

/// The active matching policy.
///
/// `threshold: None` means "use the model's built-in default"; an explicit
/// value always lies in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub model: FaceModelKind,
    pub threshold: Option<f32>,
}

impl MatchPolicy {
    /// Policy for `model` with its built-in default threshold.
    pub fn for_model(model: FaceModelKind) -> Self {
        Self { model, threshold: None }
    }

    /// The threshold actually applied to matches. Reads never see the raw
    /// reset sentinel, only a usable cutoff.
    pub fn effective_threshold(&self) -> f32 {
        self.threshold.unwrap_or_else(|| self.model.default_threshold())
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::for_model(FaceModelKind::default())
    }
}

/// Partial policy update. An absent model keeps the current one; an absent
/// or zero threshold resets the cutoff to the (possibly new) model's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyUpdate {
    pub model: Option<FaceModelKind>,
    pub threshold: Option<f32>,
}

impl PolicyUpdate {
    /// Resolve this update against the current policy, validating the
    /// threshold. Also used by callers that persist the policy themselves
    /// instead of going through a registry.
    pub fn apply_to(self, current: MatchPolicy) -> Result<MatchPolicy, PolicyError> {
        let threshold = match self.threshold {
            None => None,
            Some(t) if t == 0.0 => None,
            Some(t) if t.is_finite() && t > 0.0 && t <= 1.0 => Some(t),
            Some(t) => return Err(PolicyError::ThresholdOutOfRange(t)),
        };
        Ok(MatchPolicy {
            model: self.model.unwrap_or(current.model),
            threshold,
        })
    }
}

/// Single authoritative policy instance, shared by all in-flight
/// registrations. Synchronous; updates are visible to subsequent reads
/// immediately. Single-process semantics only.
pub struct SettingsRegistry {
    policy: RwLock<MatchPolicy>,
}

impl SettingsRegistry {
    pub fn new(initial: MatchPolicy) -> Self {
        Self { policy: RwLock::new(initial) }
    }

    /// Snapshot of the current policy.
    pub fn get(&self) -> MatchPolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a partial update and return the resulting policy. A failed
    /// update leaves the current policy untouched.
    pub fn update(&self, update: PolicyUpdate) -> Result<MatchPolicy, PolicyError> {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        let previous = *policy;
        *policy = update.apply_to(previous)?;

        tracing::info!(
            model = %policy.model,
            threshold = policy.effective_threshold(),
            previous_model = %previous.model,
            previous_threshold = previous.effective_threshold(),
            "match policy updated"
        );
        Ok(*policy)
    }
}

impl Default for SettingsRegistry {
    fn default() -> Self {
        Self::new(MatchPolicy::default())
    }
}
