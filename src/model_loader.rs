use crate::{
    archive::{read_model_graph, ArchiveError},
    assembler::{AssemblyError, ChunkAssembler},
    error::ErrorCode,
    model_service::ModelDecoder,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

/// Load failures are shared by every caller waiting on the same attempt, so
/// the error is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum ModelLoadError {
    #[error("artifact assembly failed: {0}")]
    Assembly(Arc<AssemblyError>),
    #[error("failed to read model archive: {0}")]
    Archive(Arc<ArchiveError>),
    #[error("failed to deserialize model: {0}")]
    Decode(String),
    #[error("model load did not finish within {0:?}")]
    Timeout(Duration),
    #[error("model load task aborted: {0}")]
    Aborted(String),
    #[error("model outputs {classes} classes but {labels} labels are configured")]
    LabelMismatch { classes: usize, labels: usize },
}

impl ModelLoadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ModelLoadError::Assembly(e) => e.code(),
            _ => ErrorCode::ModelLoadFailure,
        }
    }
}

type LoadResult<M> = Result<Arc<M>, ModelLoadError>;
type PendingLoad<M> = Shared<BoxFuture<'static, LoadResult<M>>>;

enum Slot<M> {
    Empty,
    Loading(PendingLoad<M>),
    Ready(Arc<M>),
}

/// Assembles and deserializes the model at most once at a time. Concurrent
/// callers share the in-flight attempt; a successful result is kept for the
/// lifetime of the loader, a failed one is dropped so the next call retries.
pub struct ModelLoader<D: ModelDecoder> {
    decoder: Arc<D>,
    assembler: ChunkAssembler,
    slot: Arc<Mutex<Slot<D::Model>>>,
    attempts: AtomicU64,
    load_timeout: Duration,
}

impl<D: ModelDecoder> ModelLoader<D> {
    pub fn new(decoder: D, assembler: ChunkAssembler, load_timeout: Duration) -> Self {
        Self {
            decoder: Arc::new(decoder),
            assembler,
            slot: Arc::new(Mutex::new(Slot::Empty)),
            attempts: AtomicU64::new(0),
            load_timeout,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Ready(_))
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn load(&self) -> LoadResult<D::Model> {
        let pending = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready(model) => return Ok(model.clone()),
                Slot::Loading(pending) => pending.clone(),
                Slot::Empty => {
                    let pending = self.start_attempt();
                    *slot = Slot::Loading(pending.clone());
                    pending
                }
            }
        };

        match tokio::time::timeout(self.load_timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Gave up waiting for model load after {:?}", self.load_timeout);
                Err(ModelLoadError::Timeout(self.load_timeout))
            }
        }
    }

    // Runs on its own task so the result is published even if every caller
    // has gone away.
    fn start_attempt(&self) -> PendingLoad<D::Model> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let decoder = self.decoder.clone();
        let assembler = self.assembler.clone();
        let slot = self.slot.clone();
        tracing::info!(attempt, "Starting model load");

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                load_model(&assembler, decoder.as_ref())
            })
            .await
            .unwrap_or_else(|e| Err(ModelLoadError::Aborted(e.to_string())))
            .map(Arc::new);

            let mut slot = slot.lock();
            match &result {
                Ok(model) => {
                    *slot = Slot::Ready(model.clone());
                    tracing::info!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Model loaded"
                    );
                }
                Err(e) => {
                    *slot = Slot::Empty;
                    tracing::error!(attempt, code = e.code().as_str(), "Model load failed: {}", e);
                }
            }
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ModelLoadError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }
}

fn load_model<D: ModelDecoder>(
    assembler: &ChunkAssembler,
    decoder: &D,
) -> Result<D::Model, ModelLoadError> {
    let artifact = assembler
        .assemble()
        .map_err(|e| ModelLoadError::Assembly(Arc::new(e)))?;
    let graph =
        read_model_graph(&artifact.path).map_err(|e| ModelLoadError::Archive(Arc::new(e)))?;
    decoder.decode(&graph).map_err(ModelLoadError::Decode)
}
