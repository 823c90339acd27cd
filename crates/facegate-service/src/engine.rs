//! Extraction engine: a dedicated OS thread owning the ONNX sessions.
//!
//! Inference is blocking and the sessions need `&mut`, so requests travel
//! over an mpsc queue to one worker thread and replies come back on oneshot
//! channels. Callers may drop their reply future at any point; the engine
//! still finishes or fails the job it picked up.

use async_trait::async_trait;
use facegate_core::{Embedding, ExtractError, FaceModelKind, FacePipeline};
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extraction: {0}")]
    Extract(#[from] ExtractError),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the failure is the submitter's fault (unusable photo) rather
    /// than an infrastructure fault.
    pub fn is_validation(&self) -> bool {
        match self {
            EngineError::Extract(e) => e.is_validation(),
            EngineError::ChannelClosed => false,
        }
    }
}

/// Anything that turns photo bytes into an embedding under a given model.
///
/// The production implementation is [`EngineHandle`]; tests substitute a
/// deterministic stub.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    async fn extract(&self, image: &[u8], kind: FaceModelKind)
        -> Result<Embedding, EngineError>;
}

enum EngineRequest {
    Extract {
        image: Vec<u8>,
        kind: FaceModelKind,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

#[async_trait]
impl EmbeddingExtractor for EngineHandle {
    async fn extract(
        &self,
        image: &[u8],
        kind: FaceModelKind,
    ) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image: image.to_vec(),
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the face detector synchronously (fail-fast on a missing model
/// directory), then enters the request loop. Encoder sessions load lazily
/// inside the pipeline on first use of each model kind.
pub fn spawn_engine(model_dir: &Path, queue_depth: usize) -> Result<EngineHandle, EngineError> {
    let mut pipeline = FacePipeline::open(model_dir)?;
    tracing::info!(dir = %model_dir.display(), "face pipeline ready");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, kind, reply } => {
                        let result = pipeline.extract(&image, kind).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}
