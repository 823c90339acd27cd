//! facegate-store: durable biometric corpus and photo vault.
//!
//! Embeddings are encrypted at rest (AES-256-GCM) and enumerate in
//! insertion order; original photos are kept bit-for-bit with SHA-256
//! verification and atomic writes.

pub mod corpus;
pub mod crypto;
pub mod vault;

pub use corpus::{Corpus, CorpusError, MemoryCorpus, SqliteCorpus};
pub use crypto::{CipherError, EmbeddingCipher};
pub use vault::{sha256_hex, PhotoVault, VaultError};
