//! Embedding oracle contract.
//!
//! The oracle wraps a detection model and a recognition model behind an
//! async request/response interface. Callers hand over image bytes by value
//! and get back every face found, each with its own embedding.

use crate::assets::AssetError;
use async_trait::async_trait;
use facesift_core::detector::DetectorError;
use facesift_core::DetectedFace;
use std::future::Future;
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("model initialization failed: {0}")]
    Init(String),
    #[error("model assets unavailable: {0}")]
    Assets(#[from] AssetError),
    #[error("oracle used before initialize()")]
    NotInitialized,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("face detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("oracle engine exited")]
    ChannelClosed,
    #[error("oracle engine panicked: {0}")]
    Panicked(String),
}

#[async_trait]
pub trait EmbeddingOracle: Send + Sync {
    /// Load both models. Idempotent: concurrent and repeated calls share one
    /// load, and a failed load leaves the oracle unusable but retryable.
    async fn initialize(&self) -> Result<(), OracleError>;

    fn is_ready(&self) -> bool;

    /// Length of the embeddings this oracle produces.
    fn embedding_dim(&self) -> usize;

    /// Every face in `image`. An image with no face yields an empty vec.
    async fn detect_all(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, OracleError>;
}

/// Holds the handle produced by an expensive load.
///
/// Concurrent callers share one load. A failed load stores nothing, and a
/// stored handle that is no longer alive is replaced on the next load.
pub(crate) struct SharedLoad<H> {
    current: RwLock<Option<H>>,
    loading: Mutex<()>,
    alive: fn(&H) -> bool,
}

impl<H: Clone> SharedLoad<H> {
    pub(crate) fn new(alive: fn(&H) -> bool) -> Self {
        Self {
            current: RwLock::new(None),
            loading: Mutex::new(()),
            alive,
        }
    }

    /// The live handle, if one is loaded.
    pub(crate) fn get(&self) -> Option<H> {
        let current = self.current.read().ok()?;
        current.as_ref().filter(|h| (self.alive)(h)).cloned()
    }

    pub(crate) async fn get_or_load<F, Fut>(&self, load: F) -> Result<H, OracleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, OracleError>>,
    {
        if let Some(handle) = self.get() {
            return Ok(handle);
        }
        let _loading = self.loading.lock().await;
        // another caller may have finished while we waited
        if let Some(handle) = self.get() {
            return Ok(handle);
        }

        let handle = load().await?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(handle.clone());
        }
        Ok(handle)
    }
}
