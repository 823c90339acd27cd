//! Gate configuration.
//!
//! Built-in defaults, overridden by an optional TOML file, overridden by
//! `FACEGATE_*` environment variables.

use crate::settings::MatchPolicy;
use facegate_core::{FaceModelKind, UnknownModel};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Model(#[from] UnknownModel),
    #[error("threshold {0} out of range; expected a value in (0, 1], or 0 for the model default")]
    Threshold(f32),
}

/// Resolved gate configuration.
pub struct GateConfig {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite corpus database.
    pub db_path: PathBuf,
    /// Directory for stored registration photos.
    pub vault_dir: PathBuf,
    /// Passphrase the at-rest embedding key is derived from.
    pub passphrase: String,
    /// Recognition model active at startup.
    pub model: FaceModelKind,
    /// Startup similarity threshold; `None` uses the model default.
    pub threshold: Option<f32>,
    /// Depth of the extraction engine's request queue.
    pub engine_queue: usize,
}

impl GateConfig {
    /// Load configuration. The file is `FACEGATE_CONFIG` if set, otherwise
    /// `facegate.toml` in the working directory if present.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(FileConfig::discover()?)
    }

    fn from_sources(file: FileConfig) -> Result<Self, ConfigError> {
        let data_dir = default_data_dir();

        let model_dir = env_path("FACEGATE_MODEL_DIR")
            .or(file.model_dir)
            .unwrap_or_else(|| PathBuf::from("models"));
        let db_path = env_path("FACEGATE_DB_PATH")
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("corpus.db"));
        let vault_dir = env_path("FACEGATE_VAULT_DIR")
            .or(file.vault_dir)
            .unwrap_or_else(|| data_dir.join("photos"));

        let passphrase = std::env::var("FACEGATE_PASSPHRASE")
            .ok()
            .or(file.passphrase)
            .unwrap_or_else(|| {
                tracing::warn!(
                    "FACEGATE_PASSPHRASE not set; using the built-in development passphrase"
                );
                "facegate-dev".to_string()
            });

        let model = match std::env::var("FACEGATE_MODEL").ok().or(file.model) {
            Some(name) => name.parse::<FaceModelKind>()?,
            None => FaceModelKind::default(),
        };

        let threshold = match env_f32("FACEGATE_THRESHOLD").or(file.threshold) {
            None => None,
            Some(t) if t == 0.0 => None,
            Some(t) if t.is_finite() && t > 0.0 && t <= 1.0 => Some(t),
            Some(t) => return Err(ConfigError::Threshold(t)),
        };

        let engine_queue = env_usize("FACEGATE_ENGINE_QUEUE")
            .or(file.engine_queue)
            .unwrap_or(4);

        Ok(Self {
            model_dir,
            db_path,
            vault_dir,
            passphrase,
            model,
            threshold,
            engine_queue,
        })
    }

    /// The startup match policy derived from this config.
    pub fn initial_policy(&self) -> MatchPolicy {
        MatchPolicy {
            model: self.model,
            threshold: self.threshold,
        }
    }
}

/// Optional TOML file; any subset of the keys may be present.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    vault_dir: Option<PathBuf>,
    passphrase: Option<String>,
    model: Option<String>,
    threshold: Option<f32>,
    engine_queue: Option<usize>,
}

impl FileConfig {
    fn discover() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("facegate.toml"));
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::read(&path)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        let parsed = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(parsed)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
