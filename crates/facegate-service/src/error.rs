//! Registration error taxonomy.
//!
//! Three caller-visible classes: validation (bad submission, resubmit),
//! duplicate face (domain rejection, carries the matched person), and
//! internal (infrastructure; nothing persisted for the attempt).

use crate::engine::EngineError;
use crate::person::{ProfileError, SinkError};
use facegate_core::PersonId;
use facegate_store::{CorpusError, VaultError};
use thiserror::Error;

/// Why a registration did not commit.
#[derive(Error, Debug)]
pub enum RegisterError {
    /// The submitted attributes are malformed. Resubmission required.
    #[error("invalid profile: {0}")]
    InvalidProfile(#[from] ProfileError),
    /// The submitted photo is undecodable or contains no face.
    #[error("unusable photo: {0}")]
    UnusablePhoto(#[source] EngineError),
    /// A sufficiently similar face is already registered.
    #[error("a matching person is already registered: {person} (similarity {similarity:.3})")]
    DuplicateFace { person: PersonId, similarity: f32 },
    /// Infrastructure failure. Nothing persists from the attempt.
    #[error("registration failed: {0}")]
    Internal(#[from] InternalError),
}

impl RegisterError {
    /// Validation-class errors require different input; retrying the same
    /// bytes cannot succeed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RegisterError::InvalidProfile(_) | RegisterError::UnusablePhoto(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
    #[error("photo vault: {0}")]
    Vault(#[from] VaultError),
    #[error("person sink: {0}")]
    Sink(#[from] SinkError),
    #[error("commit writer exited")]
    WriterClosed,
}
