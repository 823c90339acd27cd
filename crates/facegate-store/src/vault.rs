//! Photo vault: retains the original registration photo for each person.
//!
//! Files land atomically (temp file, fsync, rename) so a crash never leaves
//! a half-written artifact next to a committed corpus record.

use facegate_core::PersonId;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("no stored photo for person {0}")]
    NotFound(PersonId),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Hex-encoded SHA-256 of a photo artifact.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Directory of registration photos, one file per person.
#[derive(Clone)]
pub struct PhotoVault {
    root: PathBuf,
}

impl PhotoVault {
    /// Open (or create) the vault directory.
    pub async fn open(root: &Path) -> Result<Self, VaultError> {
        fs::create_dir_all(root).await?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn photo_path(&self, person: PersonId) -> PathBuf {
        self.root.join(format!("{person}.img"))
    }

    /// Store the original photo bytes for `person`, returning their SHA-256.
    pub async fn store(&self, person: PersonId, bytes: &[u8]) -> Result<String, VaultError> {
        let digest = sha256_hex(bytes);
        let path = self.photo_path(person);
        let tmp = self.root.join(format!("{person}.img.tmp"));

        let result = write_atomic(&tmp, &path, bytes).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result?;

        tracing::debug!(%person, sha256 = %digest, bytes = bytes.len(), "photo stored");
        Ok(digest)
    }

    /// Read back the stored photo bytes.
    pub async fn load(&self, person: PersonId) -> Result<Vec<u8>, VaultError> {
        match fs::read(self.photo_path(person)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(person))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the stored photo exists and still hashes to `expected_sha256`.
    pub async fn verify(&self, person: PersonId, expected_sha256: &str) -> Result<bool, VaultError> {
        match self.load(person).await {
            Ok(bytes) => Ok(sha256_hex(&bytes) == expected_sha256),
            Err(VaultError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a person's photo. Returns whether one existed.
    pub async fn remove(&self, person: PersonId) -> Result<bool, VaultError> {
        match fs::remove_file(self.photo_path(person)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every stored photo. Intended for tests and operator resets.
    pub async fn clear(&self) -> Result<(), VaultError> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "img") {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

async fn write_atomic(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}
