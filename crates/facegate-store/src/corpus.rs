//! The biometric corpus: one immutable record per registered person.
//!
//! Backed by SQLite in production and a Vec for tests. Records enumerate in
//! insertion order; the monotonic `seq` column preserves that order across
//! restarts and deletions.

use crate::crypto::{CipherError, EmbeddingCipher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facegate_core::{BiometricRecord, Embedding, FaceModelKind, PersonId};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("person {0} already has a biometric record")]
    DuplicatePerson(PersonId),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("corrupt record for person {person}: {reason}")]
    Corrupt { person: String, reason: String },
}

/// Storage abstraction for the biometric corpus.
///
/// Implementations must enumerate records in insertion order and enforce at
/// most one record per person.
#[async_trait]
pub trait Corpus: Send + Sync {
    /// All records, oldest first.
    async fn all(&self) -> Result<Vec<BiometricRecord>, CorpusError>;

    /// Insert a new record. Fails with [`CorpusError::DuplicatePerson`] if
    /// the person already has one.
    async fn insert(&self, record: BiometricRecord) -> Result<(), CorpusError>;

    /// Remove a person's record. Returns whether a record existed.
    async fn remove(&self, person: PersonId) -> Result<bool, CorpusError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, CorpusError>;

    /// Delete every record. Intended for tests and operator resets.
    async fn clear(&self) -> Result<(), CorpusError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS corpus (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id       TEXT NOT NULL UNIQUE,
    model           TEXT NOT NULL,
    dim             INTEGER NOT NULL,
    embedding       BLOB NOT NULL,
    artifact_sha256 TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
";

/// SQLite-backed corpus with embeddings encrypted at rest.
pub struct SqliteCorpus {
    conn: Connection,
    cipher: EmbeddingCipher,
}

impl SqliteCorpus {
    /// Open (or create) the corpus database at `path`.
    pub async fn open(path: &Path, cipher: EmbeddingCipher) -> Result<Self, CorpusError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        tracing::info!(path = %path.display(), "corpus opened");
        Ok(Self { conn, cipher })
    }
}

#[async_trait]
impl Corpus for SqliteCorpus {
    async fn all(&self) -> Result<Vec<BiometricRecord>, CorpusError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT person_id, model, dim, embedding, artifact_sha256, created_at \
                     FROM corpus ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|row| decode_row(&self.cipher, row))
            .collect()
    }

    async fn insert(&self, record: BiometricRecord) -> Result<(), CorpusError> {
        let person = record.person;
        let person_s = person.to_string();
        let model_s = record.embedding.model.as_str().to_string();
        let dim = record.embedding.values.len() as i64;
        let blob = self.cipher.seal(&pack_values(&record.embedding.values))?;
        let sha = record.artifact_sha256;
        let created = record.created_at.to_rfc3339();

        let inserted = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO corpus (person_id, model, dim, embedding, artifact_sha256, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![person_s, model_s, dim, blob, sha, created],
                ) {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !inserted {
            return Err(CorpusError::DuplicatePerson(person));
        }
        Ok(())
    }

    async fn remove(&self, person: PersonId) -> Result<bool, CorpusError> {
        let person_s = person.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM corpus WHERE person_id = ?1", [person_s])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, CorpusError> {
        let n = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM corpus", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<(), CorpusError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM corpus", [])?;
                Ok(())
            })
            .await?;
        tracing::warn!("corpus cleared");
        Ok(())
    }
}

type RawRow = (String, String, i64, Vec<u8>, String, String);

fn decode_row(cipher: &EmbeddingCipher, row: RawRow) -> Result<BiometricRecord, CorpusError> {
    let (person_s, model_s, dim, blob, artifact_sha256, created_s) = row;

    let person = Uuid::parse_str(&person_s).map(PersonId).map_err(|e| CorpusError::Corrupt {
        person: person_s.clone(),
        reason: format!("person id: {e}"),
    })?;
    let model: FaceModelKind = model_s.parse().map_err(|e| CorpusError::Corrupt {
        person: person_s.clone(),
        reason: format!("{e}"),
    })?;
    let created_at = DateTime::parse_from_rfc3339(&created_s)
        .map_err(|e| CorpusError::Corrupt {
            person: person_s.clone(),
            reason: format!("created_at: {e}"),
        })?
        .with_timezone(&Utc);

    let plain = cipher.open(&blob)?;
    let values = unpack_values(&plain).ok_or_else(|| CorpusError::Corrupt {
        person: person_s.clone(),
        reason: "embedding blob length not a multiple of 4".into(),
    })?;
    if values.len() != dim as usize {
        return Err(CorpusError::Corrupt {
            person: person_s,
            reason: format!("dim mismatch: column says {dim}, vector has {}", values.len()),
        });
    }

    Ok(BiometricRecord {
        person,
        embedding: Embedding { values, model },
        artifact_sha256,
        created_at,
    })
}

/// Little-endian f32 packing. Reload is bit-exact.
fn pack_values(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn unpack_values(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Vec-backed corpus for tests. Same contract as [`SqliteCorpus`].
#[derive(Default)]
pub struct MemoryCorpus {
    records: Mutex<Vec<BiometricRecord>>,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BiometricRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Corpus for MemoryCorpus {
    async fn all(&self) -> Result<Vec<BiometricRecord>, CorpusError> {
        Ok(self.lock().clone())
    }

    async fn insert(&self, record: BiometricRecord) -> Result<(), CorpusError> {
        let mut records = self.lock();
        if records.iter().any(|r| r.person == record.person) {
            return Err(CorpusError::DuplicatePerson(record.person));
        }
        records.push(record);
        Ok(())
    }

    async fn remove(&self, person: PersonId) -> Result<bool, CorpusError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| r.person != person);
        Ok(records.len() != before)
    }

    async fn count(&self) -> Result<usize, CorpusError> {
        Ok(self.lock().len())
    }

    async fn clear(&self) -> Result<(), CorpusError> {
        self.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: Vec<f32>, model: FaceModelKind) -> BiometricRecord {
        BiometricRecord {
            person: PersonId::new(),
            embedding: Embedding { values, model },
            artifact_sha256: "ab".repeat(32),
            created_at: Utc::now(),
        }
    }

    fn cipher() -> EmbeddingCipher {
        EmbeddingCipher::from_passphrase("test-passphrase")
    }

    #[tokio::test]
    async fn test_memory_insert_and_order() {
        let corpus = MemoryCorpus::new();
        let a = record(vec![1.0, 0.0], FaceModelKind::ArcFaceR50);
        let b = record(vec![0.0, 1.0], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();
        corpus.insert(b.clone()).await.unwrap();

        let all = corpus.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].person, a.person);
        assert_eq!(all[1].person, b.person);
    }

    #[tokio::test]
    async fn test_memory_duplicate_person_rejected() {
        let corpus = MemoryCorpus::new();
        let a = record(vec![1.0], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();

        let err = corpus.insert(a.clone()).await.unwrap_err();
        assert!(matches!(err, CorpusError::DuplicatePerson(p) if p == a.person));
        assert_eq!(corpus.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_remove_and_clear() {
        let corpus = MemoryCorpus::new();
        let a = record(vec![1.0], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();

        assert!(corpus.remove(a.person).await.unwrap());
        assert!(!corpus.remove(a.person).await.unwrap());
        assert_eq!(corpus.count().await.unwrap(), 0);

        corpus.insert(record(vec![2.0], FaceModelKind::ArcFaceR50)).await.unwrap();
        corpus.clear().await.unwrap();
        assert_eq!(corpus.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_reload_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");

        // Awkward floats on purpose: reload must preserve exact bits.
        let a = record(
            vec![std::f32::consts::PI, 1e-7, -0.0, f32::MIN_POSITIVE],
            FaceModelKind::ArcFaceR50,
        );
        let b = record(vec![0.25, -0.75, 0.5, 1.0], FaceModelKind::MobileFaceNet);

        {
            let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();
            corpus.insert(a.clone()).await.unwrap();
            corpus.insert(b.clone()).await.unwrap();
        }

        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();
        let all = corpus.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].person, a.person);
        assert_eq!(all[1].person, b.person);
        assert_eq!(all[0].embedding.model, FaceModelKind::ArcFaceR50);
        assert_eq!(all[1].embedding.model, FaceModelKind::MobileFaceNet);
        assert_eq!(all[0].artifact_sha256, a.artifact_sha256);
        assert_eq!(all[0].created_at, a.created_at);
        for (x, y) in all[0].embedding.values.iter().zip(a.embedding.values.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[tokio::test]
    async fn test_sqlite_order_survives_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();

        let a = record(vec![1.0], FaceModelKind::ArcFaceR50);
        let b = record(vec![2.0], FaceModelKind::ArcFaceR50);
        let c = record(vec![3.0], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();
        corpus.insert(b.clone()).await.unwrap();
        corpus.insert(c.clone()).await.unwrap();

        assert!(corpus.remove(b.person).await.unwrap());
        let d = record(vec![4.0], FaceModelKind::ArcFaceR50);
        corpus.insert(d.clone()).await.unwrap();

        let order: Vec<PersonId> =
            corpus.all().await.unwrap().into_iter().map(|r| r.person).collect();
        assert_eq!(order, vec![a.person, c.person, d.person]);
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_person_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();

        let a = record(vec![1.0], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();

        let mut again = record(vec![9.0], FaceModelKind::ArcFaceR50);
        again.person = a.person;
        let err = corpus.insert(again).await.unwrap_err();
        assert!(matches!(err, CorpusError::DuplicatePerson(p) if p == a.person));
        assert_eq!(corpus.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_embedding_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();

        let a = record(vec![0.5, -0.5, 0.25], FaceModelKind::ArcFaceR50);
        corpus.insert(a.clone()).await.unwrap();

        let blob = corpus
            .conn
            .call(|conn| {
                let blob: Vec<u8> =
                    conn.query_row("SELECT embedding FROM corpus", [], |row| row.get(0))?;
                Ok(blob)
            })
            .await
            .unwrap();

        let plaintext = pack_values(&a.embedding.values);
        assert_ne!(blob, plaintext);
        assert!(blob.len() > plaintext.len(), "ciphertext carries nonce and tag");
    }

    #[tokio::test]
    async fn test_sqlite_tampered_blob_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();

        corpus.insert(record(vec![0.5, 0.5], FaceModelKind::ArcFaceR50)).await.unwrap();

        corpus
            .conn
            .call(|conn| {
                let mut blob: Vec<u8> =
                    conn.query_row("SELECT embedding FROM corpus", [], |row| row.get(0))?;
                let last = blob.len() - 1;
                blob[last] ^= 0x01;
                conn.execute("UPDATE corpus SET embedding = ?1", [blob])?;
                Ok(())
            })
            .await
            .unwrap();

        let err = corpus.all().await.unwrap_err();
        assert!(matches!(err, CorpusError::Cipher(CipherError::Decrypt)));
    }

    #[tokio::test]
    async fn test_sqlite_unknown_model_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let corpus = SqliteCorpus::open(&path, cipher()).await.unwrap();

        corpus.insert(record(vec![0.5], FaceModelKind::ArcFaceR50)).await.unwrap();
        corpus
            .conn
            .call(|conn| {
                conn.execute("UPDATE corpus SET model = 'facenet'", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let err = corpus.all().await.unwrap_err();
        assert!(matches!(err, CorpusError::Corrupt { .. }));
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let values = vec![1.5f32, -2.25, 0.0, f32::NAN];
        let unpacked = unpack_values(&pack_values(&values)).unwrap();
        assert_eq!(unpacked.len(), values.len());
        for (a, b) in unpacked.iter().zip(values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_unpack_rejects_ragged_input() {
        assert!(unpack_values(&[0u8; 7]).is_none());
    }
}
