//! The registration gate: extraction, matching, and atomic commit-or-reject.
//!
//! Every registration moves through received, extracted, matched, and then
//! exactly one terminal state: committed, rejected, or failed. The
//! match-then-insert region runs inside a single writer task, so concurrent
//! submissions of the same face serialize there and only the first commits.

use crate::engine::EmbeddingExtractor;
use crate::error::{InternalError, RegisterError};
use crate::notify::RegistrationNotifier;
use crate::person::{PersonProfile, PersonSink};
use crate::settings::SettingsRegistry;
use chrono::Utc;
use facegate_core::{
    BiometricRecord, CosineMatcher, Embedding, MatchOutcome, Matcher, PersonId,
};
use facegate_store::{Corpus, PhotoVault};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const WRITER_QUEUE_DEPTH: usize = 16;

enum WriterRequest {
    Commit {
        profile: PersonProfile,
        image: Vec<u8>,
        embedding: Embedding,
        reply: oneshot::Sender<Result<PersonId, RegisterError>>,
    },
    Remove {
        person: PersonId,
        reply: oneshot::Sender<Result<bool, RegisterError>>,
    },
}

/// Orchestrates registration end to end. The only component with write
/// access to the corpus and the vault.
pub struct RegistrationGate {
    extractor: Arc<dyn EmbeddingExtractor>,
    settings: Arc<SettingsRegistry>,
    corpus: Arc<dyn Corpus>,
    vault: PhotoVault,
    writer: mpsc::Sender<WriterRequest>,
}

impl RegistrationGate {
    /// Build the gate and spawn its writer task. Call inside a tokio
    /// runtime.
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        settings: Arc<SettingsRegistry>,
        corpus: Arc<dyn Corpus>,
        vault: PhotoVault,
        sink: Arc<dyn PersonSink>,
        notifier: Arc<dyn RegistrationNotifier>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let writer = CommitWriter {
            settings: Arc::clone(&settings),
            corpus: Arc::clone(&corpus),
            vault: vault.clone(),
            sink,
            notifier,
            matcher: CosineMatcher,
        };
        tokio::spawn(writer.run(rx));

        Self {
            extractor,
            settings,
            corpus,
            vault,
            writer: tx,
        }
    }

    /// Run one registration to a terminal state: committed (the new person
    /// id), rejected ([`RegisterError::DuplicateFace`]), or failed.
    pub async fn register(
        &self,
        profile: PersonProfile,
        image: Vec<u8>,
    ) -> Result<PersonId, RegisterError> {
        profile.validate()?;

        // Model read once at extraction start; the writer re-snapshots the
        // policy when matching begins.
        let model = self.settings.get().model;
        let embedding = match self.extractor.extract(&image, model).await {
            Ok(e) => e,
            Err(e) if e.is_validation() => return Err(RegisterError::UnusablePhoto(e)),
            Err(e) => return Err(InternalError::Engine(e).into()),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer
            .send(WriterRequest::Commit {
                profile,
                image,
                embedding,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegisterError::Internal(InternalError::WriterClosed))?;
        reply_rx
            .await
            .map_err(|_| RegisterError::Internal(InternalError::WriterClosed))?
    }

    /// Cascade removal of a person's biometric state: corpus record, photo
    /// artifact, then the relational row via the sink. Returns whether a
    /// record existed.
    pub async fn remove_person(&self, person: PersonId) -> Result<bool, RegisterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer
            .send(WriterRequest::Remove {
                person,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegisterError::Internal(InternalError::WriterClosed))?;
        reply_rx
            .await
            .map_err(|_| RegisterError::Internal(InternalError::WriterClosed))?
    }

    /// All committed records, oldest first. Reads never contend with the
    /// writer.
    pub async fn records(&self) -> Result<Vec<BiometricRecord>, RegisterError> {
        Ok(self.corpus.all().await.map_err(InternalError::Corpus)?)
    }

    pub async fn count(&self) -> Result<usize, RegisterError> {
        Ok(self.corpus.count().await.map_err(InternalError::Corpus)?)
    }

    /// Whether the stored photo for `person` still hashes to `sha256`.
    pub async fn verify_artifact(
        &self,
        person: PersonId,
        sha256: &str,
    ) -> Result<bool, RegisterError> {
        Ok(self
            .vault
            .verify(person, sha256)
            .await
            .map_err(InternalError::Vault)?)
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }
}

struct CommitWriter {
    settings: Arc<SettingsRegistry>,
    corpus: Arc<dyn Corpus>,
    vault: PhotoVault,
    sink: Arc<dyn PersonSink>,
    notifier: Arc<dyn RegistrationNotifier>,
    matcher: CosineMatcher,
}

impl CommitWriter {
    /// Single-consumer loop. Serializing match-then-insert here is what
    /// keeps two concurrent registrations of the same face from both seeing
    /// no match. A commit that has started always runs to completion, even
    /// if the requesting caller has gone away.
    async fn run(self, mut rx: mpsc::Receiver<WriterRequest>) {
        while let Some(req) = rx.recv().await {
            match req {
                WriterRequest::Commit {
                    profile,
                    image,
                    embedding,
                    reply,
                } => {
                    let result = self.commit(&profile, &image, embedding).await;
                    if let Ok(person) = &result {
                        self.spawn_notify(*person, profile);
                    }
                    if reply.send(result).is_err() {
                        tracing::debug!("caller gone before learning the registration outcome");
                    }
                }
                WriterRequest::Remove { person, reply } => {
                    let _ = reply.send(self.remove(person).await);
                }
            }
        }
        tracing::info!("commit writer exiting");
    }

    async fn commit(
        &self,
        profile: &PersonProfile,
        image: &[u8],
        embedding: Embedding,
    ) -> Result<PersonId, RegisterError> {
        // Policy snapshot, taken once at the start of matching.
        let policy = self.settings.get();
        let threshold = if policy.model == embedding.model {
            policy.effective_threshold()
        } else {
            tracing::warn!(
                probe = %embedding.model,
                policy = %policy.model,
                "policy model changed while extraction ran; matching with the probe model's default threshold"
            );
            embedding.model.default_threshold()
        };

        let records = self.corpus.all().await.map_err(InternalError::Corpus)?;
        let scan = self.matcher.find_match(&embedding, &records, threshold);
        if scan.skipped_foreign > 0 {
            tracing::debug!(
                skipped = scan.skipped_foreign,
                model = %embedding.model,
                "scan skipped records from other models"
            );
        }

        if let MatchOutcome::Match { person, similarity } = scan.outcome {
            tracing::info!(
                matched = %person,
                similarity,
                threshold,
                "registration rejected: duplicate face"
            );
            return Err(RegisterError::DuplicateFace { person, similarity });
        }

        // No match: commit. Order matters for rollback: photo, corpus
        // record, relational row; unwind in reverse on failure.
        let person = PersonId::new();
        let sha = self
            .vault
            .store(person, image)
            .await
            .map_err(InternalError::Vault)?;

        let record = BiometricRecord {
            person,
            embedding,
            artifact_sha256: sha,
            created_at: Utc::now(),
        };
        if let Err(e) = self.corpus.insert(record).await {
            self.rollback_vault(person).await;
            return Err(InternalError::Corpus(e).into());
        }

        if let Err(e) = self.sink.commit_person(person, profile).await {
            self.rollback_record(person).await;
            self.rollback_vault(person).await;
            return Err(InternalError::Sink(e).into());
        }

        tracing::info!(
            %person,
            best_similarity = scan.best_similarity,
            compared = scan.compared,
            threshold,
            "registration committed"
        );
        Ok(person)
    }

    async fn remove(&self, person: PersonId) -> Result<bool, RegisterError> {
        let removed = self.corpus.remove(person).await.map_err(InternalError::Corpus)?;
        if removed {
            self.vault.remove(person).await.map_err(InternalError::Vault)?;
            self.sink.delete_person(person).await.map_err(InternalError::Sink)?;
            tracing::info!(%person, "person removed");
        }
        Ok(removed)
    }

    /// Rollback failures are logged, not propagated; the original commit
    /// error is the one the caller needs to see.
    async fn rollback_vault(&self, person: PersonId) {
        if let Err(e) = self.vault.remove(person).await {
            tracing::error!(%person, error = %e, "rollback: failed to remove staged photo");
        }
    }

    async fn rollback_record(&self, person: PersonId) {
        if let Err(e) = self.corpus.remove(person).await {
            tracing::error!(%person, error = %e, "rollback: failed to remove corpus record");
        }
    }

    /// Fire-and-forget: runs outside the commit, never rolls it back.
    fn spawn_notify(&self, person: PersonId, profile: PersonProfile) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.registration_committed(person, &profile).await {
                tracing::warn!(%person, error = %e, "registration notifier failed");
            }
        });
    }
}
