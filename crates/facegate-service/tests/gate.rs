//! End-to-end gate behavior over a deterministic stub extractor and
//! tempdir-backed stores. No ONNX models are required here.

use async_trait::async_trait;
use chrono::NaiveDate;
use facegate_core::{Embedding, ExtractError, FaceModelKind, PersonId, PhotoError};
use facegate_service::{
    EmbeddingExtractor, EngineError, Gender, NotifyError, NullNotifier, NullSink, PersonProfile,
    PersonSink, PolicyUpdate, RegisterError, RegistrationGate, RegistrationNotifier,
    SettingsRegistry, SinkError,
};
use facegate_store::{Corpus, EmbeddingCipher, MemoryCorpus, PhotoVault, SqliteCorpus};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DIM: usize = 512;

fn unit(index: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[index] = 1.0;
    v
}

fn blend(a: usize, b: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[a] = 0.8;
    v[b] = 0.6;
    v
}

/// Deterministic extractor: the first image byte selects the embedding.
///
/// Byte 0 behaves like a photo with no detectable face; an empty input like
/// an undecodable one. Bytes 1, 2 and 3 produce vectors with known pairwise
/// similarities (1 vs 2: 0.8, 1 vs 3: 0.8, 2 vs 3: 0.64). Every other byte
/// maps to its own unit vector, orthogonal to all the rest.
struct StubExtractor;

#[async_trait]
impl EmbeddingExtractor for StubExtractor {
    async fn extract(
        &self,
        image: &[u8],
        kind: FaceModelKind,
    ) -> Result<Embedding, EngineError> {
        let Some(&first) = image.first() else {
            return Err(EngineError::Extract(ExtractError::Decode(PhotoError::Empty)));
        };
        let values = match first {
            0 => return Err(EngineError::Extract(ExtractError::NoFaceDetected)),
            2 => blend(1, 2),
            3 => blend(1, 3),
            b => unit(b as usize),
        };
        Ok(Embedding { values, model: kind })
    }
}

/// Extractor that applies a pending policy update just before returning,
/// so the writer's policy snapshot disagrees with the probe's model.
struct PolicyFlippingExtractor {
    settings: Arc<SettingsRegistry>,
    pending: Mutex<Option<PolicyUpdate>>,
}

#[async_trait]
impl EmbeddingExtractor for PolicyFlippingExtractor {
    async fn extract(
        &self,
        image: &[u8],
        kind: FaceModelKind,
    ) -> Result<Embedding, EngineError> {
        let embedding = StubExtractor.extract(image, kind).await?;
        if let Some(update) = self.pending.lock().unwrap().take() {
            self.settings.update(update).unwrap();
        }
        Ok(embedding)
    }
}

fn profile(email: &str, id_number: &str) -> PersonProfile {
    PersonProfile {
        first_name: "Ana".into(),
        last_name: "Quispe".into(),
        email: email.into(),
        phone: "0991234567".into(),
        gender: Gender::Female,
        date_of_birth: NaiveDate::from_ymd_opt(1995, 4, 12).unwrap(),
        id_number_type: "cedula".into(),
        id_number: id_number.into(),
        accepted_terms: true,
    }
}

async fn gate_with(
    sink: Arc<dyn PersonSink>,
    notifier: Arc<dyn RegistrationNotifier>,
) -> (RegistrationGate, Arc<MemoryCorpus>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let corpus = Arc::new(MemoryCorpus::new());
    let vault = PhotoVault::open(dir.path()).await.unwrap();
    let gate = RegistrationGate::new(
        Arc::new(StubExtractor),
        Arc::new(SettingsRegistry::default()),
        corpus.clone(),
        vault,
        sink,
        notifier,
    );
    (gate, corpus, dir)
}

async fn memory_gate() -> (RegistrationGate, Arc<MemoryCorpus>, tempfile::TempDir) {
    gate_with(Arc::new(NullSink), Arc::new(NullNotifier)).await
}

fn stored_photos(dir: &tempfile::TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "img"))
        .count()
}

#[derive(Default)]
struct RecordingSink {
    commits: Mutex<Vec<PersonId>>,
}

#[async_trait]
impl PersonSink for RecordingSink {
    async fn commit_person(
        &self,
        person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), SinkError> {
        self.commits.lock().unwrap().push(person);
        Ok(())
    }

    async fn delete_person(&self, person: PersonId) -> Result<(), SinkError> {
        self.commits.lock().unwrap().retain(|p| *p != person);
        Ok(())
    }
}

struct FailSink;

#[async_trait]
impl PersonSink for FailSink {
    async fn commit_person(
        &self,
        _person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), SinkError> {
        Err(SinkError("relational transaction aborted".into()))
    }

    async fn delete_person(&self, _person: PersonId) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink slow enough that a caller timeout fires while the commit is still
/// in flight.
#[derive(Default)]
struct SlowSink {
    commits: Mutex<Vec<PersonId>>,
}

#[async_trait]
impl PersonSink for SlowSink {
    async fn commit_person(
        &self,
        person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.commits.lock().unwrap().push(person);
        Ok(())
    }

    async fn delete_person(&self, _person: PersonId) -> Result<(), SinkError> {
        Ok(())
    }
}

struct ChannelNotifier {
    tx: tokio::sync::mpsc::UnboundedSender<PersonId>,
}

#[async_trait]
impl RegistrationNotifier for ChannelNotifier {
    async fn registration_committed(
        &self,
        person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), NotifyError> {
        let _ = self.tx.send(person);
        Ok(())
    }
}

struct FailNotifier;

#[async_trait]
impl RegistrationNotifier for FailNotifier {
    async fn registration_committed(
        &self,
        _person: PersonId,
        _profile: &PersonProfile,
    ) -> Result<(), NotifyError> {
        Err(NotifyError("smtp relay unreachable".into()))
    }
}

#[tokio::test]
async fn test_first_registration_commits() {
    let (gate, corpus, dir) = memory_gate().await;

    let person = gate
        .register(profile("ana@gmail.com", "1712345678"), vec![7, 1, 2, 3])
        .await
        .unwrap();

    assert_eq!(corpus.count().await.unwrap(), 1);
    assert_eq!(stored_photos(&dir), 1);

    let records = gate.records().await.unwrap();
    assert_eq!(records[0].person, person);
    assert_eq!(records[0].embedding.model, FaceModelKind::ArcFaceR50);
    assert!(
        gate.verify_artifact(person, &records[0].artifact_sha256)
            .await
            .unwrap(),
        "stored photo must hash to the recorded digest"
    );
}

#[tokio::test]
async fn test_same_face_rejected_with_matched_person() {
    let (gate, corpus, _dir) = memory_gate().await;

    let image_a = vec![7u8, 9, 9];
    let p1 = gate
        .register(profile("p1@gmail.com", "1700000001"), image_a.clone())
        .await
        .unwrap();

    // Same face, entirely different attributes.
    let err = gate
        .register(profile("p2@hotmail.com", "1700000002"), image_a)
        .await
        .unwrap_err();
    match err {
        RegisterError::DuplicateFace { person, similarity } => {
            assert_eq!(person, p1);
            assert!(similarity > 0.99, "identical vectors, got {similarity}");
        }
        other => panic!("expected DuplicateFace, got {other}"),
    }

    // An unrelated face still registers.
    let p3 = gate
        .register(profile("p3@gmail.com", "1700000003"), vec![8u8])
        .await
        .unwrap();
    assert_ne!(p3, p1);
    assert_eq!(corpus.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_rejection_is_idempotent() {
    let (gate, corpus, _dir) = memory_gate().await;

    let image = vec![11u8, 4];
    gate.register(profile("a@gmail.com", "1700000010"), image.clone())
        .await
        .unwrap();

    for i in 0..2 {
        let err = gate
            .register(profile(&format!("b{i}@gmail.com"), &format!("17000000{i}1")), image.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::DuplicateFace { .. }), "attempt {i}: {err}");
    }
    assert_eq!(corpus.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_no_face_detected_leaves_no_state() {
    let sink = Arc::new(RecordingSink::default());
    let (gate, corpus, dir) = gate_with(sink.clone(), Arc::new(NullNotifier)).await;

    let err = gate
        .register(profile("a@gmail.com", "1712345678"), vec![0u8, 1, 2])
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::UnusablePhoto(_)));
    assert!(err.is_validation());

    assert_eq!(corpus.count().await.unwrap(), 0);
    assert_eq!(stored_photos(&dir), 0);
    assert!(sink.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_image_rejected() {
    let (gate, corpus, _dir) = memory_gate().await;

    let err = gate
        .register(profile("a@gmail.com", "1712345678"), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::UnusablePhoto(_)));
    assert!(err.is_validation());
    assert_eq!(corpus.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_profile_rejected_before_extraction() {
    let (gate, corpus, dir) = memory_gate().await;

    let mut p = profile("a@gmail.com", "1712345678");
    p.accepted_terms = false;
    let err = gate.register(p, vec![5u8]).await.unwrap_err();
    assert!(matches!(err, RegisterError::InvalidProfile(_)));
    assert!(err.is_validation());
    assert_eq!(corpus.count().await.unwrap(), 0);
    assert_eq!(stored_photos(&dir), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_submissions() {
    let (gate, corpus, dir) = memory_gate().await;
    let gate = Arc::new(gate);

    let image = vec![42u8, 1, 2, 3];
    let mut handles = Vec::new();
    for i in 0..8 {
        let gate = Arc::clone(&gate);
        let image = image.clone();
        handles.push(tokio::spawn(async move {
            gate.register(
                profile(&format!("c{i}@gmail.com"), &format!("17{i:08}")),
                image,
            )
            .await
        }));
    }

    let mut committed = Vec::new();
    let mut rejected = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(person) => committed.push(person),
            Err(RegisterError::DuplicateFace { person, .. }) => rejected.push(person),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(committed.len(), 1, "exactly one submission may win");
    assert_eq!(rejected.len(), 7);
    assert!(rejected.iter().all(|p| *p == committed[0]));
    assert_eq!(corpus.count().await.unwrap(), 1);
    assert_eq!(stored_photos(&dir), 1);
}

#[tokio::test]
async fn test_policy_change_applies_only_to_future_matches() {
    let (gate, corpus, _dir) = memory_gate().await;

    gate.settings()
        .update(PolicyUpdate { model: None, threshold: Some(0.9) })
        .unwrap();

    let p1 = gate
        .register(profile("p1@gmail.com", "1700000001"), vec![1u8])
        .await
        .unwrap();
    // Similarity to p1 is 0.8, below the 0.9 cutoff.
    gate.register(profile("p2@gmail.com", "1700000002"), vec![2u8])
        .await
        .unwrap();
    assert_eq!(corpus.count().await.unwrap(), 2);

    // Tightening the policy afterwards must not re-evaluate p2...
    gate.settings()
        .update(PolicyUpdate { model: None, threshold: Some(0.5) })
        .unwrap();
    assert_eq!(corpus.count().await.unwrap(), 2);

    // ...but it does govern the next submission: best similarity is 0.8
    // against p1, and p1 is the one reported.
    let err = gate
        .register(profile("p3@gmail.com", "1700000003"), vec![3u8])
        .await
        .unwrap_err();
    match err {
        RegisterError::DuplicateFace { person, similarity } => {
            assert_eq!(person, p1);
            assert!((similarity - 0.8).abs() < 1e-5, "got {similarity}");
        }
        other => panic!("expected DuplicateFace, got {other}"),
    }
}

#[tokio::test]
async fn test_model_swap_mid_flight_matches_with_probe_default_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = Arc::new(MemoryCorpus::new());
    let vault = PhotoVault::open(dir.path()).await.unwrap();
    let settings = Arc::new(SettingsRegistry::default());
    let extractor = Arc::new(PolicyFlippingExtractor {
        settings: settings.clone(),
        pending: Mutex::new(None),
    });
    let gate = RegistrationGate::new(
        extractor.clone(),
        settings,
        corpus,
        vault,
        Arc::new(NullSink),
        Arc::new(NullNotifier),
    );

    let p1 = gate
        .register(profile("p1@gmail.com", "1700000001"), vec![1u8])
        .await
        .unwrap();

    // The operator swaps the model and sets a 0.9 cutoff while the next
    // submission's extraction is in flight. That probe was embedded under
    // the old model, so its own model's default threshold (0.40) governs the
    // match, not a cutoff calibrated to an unrelated score distribution:
    // similarity 0.8 against p1 stays a rejection.
    *extractor.pending.lock().unwrap() = Some(PolicyUpdate {
        model: Some(FaceModelKind::MobileFaceNet),
        threshold: Some(0.9),
    });
    let err = gate
        .register(profile("p2@gmail.com", "1700000002"), vec![2u8])
        .await
        .unwrap_err();
    match err {
        RegisterError::DuplicateFace { person, similarity } => {
            assert_eq!(person, p1);
            assert!((similarity - 0.8).abs() < 1e-5, "got {similarity}");
        }
        other => panic!("expected DuplicateFace, got {other}"),
    }
}

#[tokio::test]
async fn test_threshold_zero_reports_model_default() {
    let (gate, _corpus, _dir) = memory_gate().await;

    let policy = gate
        .settings()
        .update(PolicyUpdate { model: None, threshold: Some(0.0) })
        .unwrap();
    assert_eq!(policy.threshold, None);
    assert_eq!(
        policy.effective_threshold(),
        policy.model.default_threshold(),
        "the sentinel must never surface as the effective cutoff"
    );
}

#[tokio::test]
async fn test_sink_failure_rolls_back_everything() {
    let (gate, corpus, dir) = gate_with(Arc::new(FailSink), Arc::new(NullNotifier)).await;

    let err = gate
        .register(profile("a@gmail.com", "1712345678"), vec![6u8])
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::Internal(_)));
    assert!(!err.is_validation());

    assert_eq!(corpus.count().await.unwrap(), 0, "corpus record must be rolled back");
    assert_eq!(stored_photos(&dir), 0, "photo artifact must be rolled back");

    // The face is registrable again once the sink recovers.
    let (gate, corpus, _dir) = memory_gate().await;
    gate.register(profile("a@gmail.com", "1712345678"), vec![6u8])
        .await
        .unwrap();
    assert_eq!(corpus.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_notifier_sees_commits_but_not_rejections() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (gate, _corpus, _dir) =
        gate_with(Arc::new(NullSink), Arc::new(ChannelNotifier { tx })).await;

    let p1 = gate
        .register(profile("p1@gmail.com", "1700000001"), vec![21u8])
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(p1));

    let _ = gate
        .register(profile("p2@gmail.com", "1700000002"), vec![21u8])
        .await
        .unwrap_err();

    let p3 = gate
        .register(profile("p3@gmail.com", "1700000003"), vec![22u8])
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(p3), "rejections must not notify");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_notifier_failure_never_rolls_back() {
    let (gate, corpus, dir) = gate_with(Arc::new(NullSink), Arc::new(FailNotifier)).await;

    gate.register(profile("a@gmail.com", "1712345678"), vec![13u8])
        .await
        .unwrap();

    // Give the detached notifier task a chance to run (and fail).
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(corpus.count().await.unwrap(), 1);
    assert_eq!(stored_photos(&dir), 1);
}

#[tokio::test]
async fn test_cancelled_caller_still_reaches_a_terminal_state() {
    let sink = Arc::new(SlowSink::default());
    let (gate, corpus, dir) = gate_with(sink.clone(), Arc::new(NullNotifier)).await;

    let result = tokio::time::timeout(
        Duration::from_millis(10),
        gate.register(profile("a@gmail.com", "1712345678"), vec![33u8]),
    )
    .await;
    assert!(result.is_err(), "caller should have timed out mid-commit");

    // The writer finishes the commit it started; the corpus, the vault and
    // the sink agree afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(corpus.count().await.unwrap(), 1);
    assert_eq!(stored_photos(&dir), 1);
    assert_eq!(sink.commits.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_remove_person_cascades_and_unblocks_the_face() {
    let sink = Arc::new(RecordingSink::default());
    let (gate, corpus, dir) = gate_with(sink.clone(), Arc::new(NullNotifier)).await;

    let image = vec![5u8, 5];
    let p1 = gate
        .register(profile("a@gmail.com", "1712345678"), image.clone())
        .await
        .unwrap();
    assert_eq!(*sink.commits.lock().unwrap(), vec![p1]);

    assert!(gate.remove_person(p1).await.unwrap());
    assert_eq!(corpus.count().await.unwrap(), 0);
    assert_eq!(stored_photos(&dir), 0);
    assert!(sink.commits.lock().unwrap().is_empty());
    assert!(!gate.remove_person(p1).await.unwrap(), "second removal is a no-op");

    // With the record gone the same face registers again, as someone new.
    let p2 = gate
        .register(profile("b@gmail.com", "1787654321"), image)
        .await
        .unwrap();
    assert_ne!(p2, p1);
}

#[tokio::test]
async fn test_records_from_other_models_are_skipped() {
    let (gate, corpus, _dir) = memory_gate().await;

    let image = vec![9u8, 9];
    let p1 = gate
        .register(profile("p1@gmail.com", "1700000001"), image.clone())
        .await
        .unwrap();

    // Same face under a different model lands in an unrelated vector space,
    // so the existing record is skipped rather than compared.
    gate.settings()
        .update(PolicyUpdate {
            model: Some(FaceModelKind::MobileFaceNet),
            threshold: None,
        })
        .unwrap();
    gate.register(profile("p2@gmail.com", "1700000002"), image.clone())
        .await
        .unwrap();
    assert_eq!(corpus.count().await.unwrap(), 2);

    // Back on the original model the original record matches again.
    gate.settings()
        .update(PolicyUpdate {
            model: Some(FaceModelKind::ArcFaceR50),
            threshold: None,
        })
        .unwrap();
    let err = gate
        .register(profile("p3@gmail.com", "1700000003"), image)
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::DuplicateFace { person, .. } if person == p1));
}

#[tokio::test]
async fn test_committed_records_stay_below_threshold_pairwise() {
    let (gate, _corpus, _dir) = memory_gate().await;
    let threshold = 0.7;
    gate.settings()
        .update(PolicyUpdate { model: None, threshold: Some(threshold) })
        .unwrap();

    for (i, image) in [vec![1u8], vec![2u8], vec![4u8], vec![3u8]].into_iter().enumerate() {
        let _ = gate
            .register(profile(&format!("u{i}@gmail.com"), &format!("17{i:08}")), image)
            .await;
    }

    let records = gate.records().await.unwrap();
    assert!(records.len() >= 2);
    for i in 0..records.len() {
        for j in i + 1..records.len() {
            let s = records[i].embedding.similarity(&records[j].embedding);
            assert!(
                s < threshold,
                "records {i} and {j} are {s} similar, cutoff {threshold}"
            );
        }
    }
}

#[tokio::test]
async fn test_sqlite_gate_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("corpus.db");
    let photos = dir.path().join("photos");

    let person;
    let values;
    {
        let corpus = Arc::new(
            SqliteCorpus::open(&db, EmbeddingCipher::from_passphrase("pw"))
                .await
                .unwrap(),
        );
        let vault = PhotoVault::open(&photos).await.unwrap();
        let gate = RegistrationGate::new(
            Arc::new(StubExtractor),
            Arc::new(SettingsRegistry::default()),
            corpus.clone(),
            vault,
            Arc::new(NullSink),
            Arc::new(NullNotifier),
        );
        person = gate
            .register(profile("x@gmail.com", "1700000001"), vec![77u8, 1])
            .await
            .unwrap();
        values = corpus.all().await.unwrap()[0].embedding.values.clone();
    }

    let corpus = Arc::new(
        SqliteCorpus::open(&db, EmbeddingCipher::from_passphrase("pw"))
            .await
            .unwrap(),
    );
    let vault = PhotoVault::open(&photos).await.unwrap();
    let gate = RegistrationGate::new(
        Arc::new(StubExtractor),
        Arc::new(SettingsRegistry::default()),
        corpus,
        vault,
        Arc::new(NullSink),
        Arc::new(NullNotifier),
    );

    let records = gate.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].person, person);
    for (a, b) in records[0].embedding.values.iter().zip(values.iter()) {
        assert_eq!(a.to_bits(), b.to_bits(), "reload must be bit-exact");
    }
    assert!(
        gate.verify_artifact(person, &records[0].artifact_sha256)
            .await
            .unwrap()
    );

    // The same face is still blocked after the restart.
    let err = gate
        .register(profile("y@gmail.com", "1700000002"), vec![77u8, 2])
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::DuplicateFace { person: p, .. } if p == person));
}
