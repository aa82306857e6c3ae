//! ONNX-backed embedding oracle.
//!
//! Both sessions live on a dedicated OS thread. Async callers send requests
//! over a channel and await a oneshot reply, so inference never blocks the
//! runtime and only one image is decoded at a time.

use crate::assets::{ModelAssets, ModelPaths};
use crate::oracle::{EmbeddingOracle, OracleError, SharedLoad};
use async_trait::async_trait;
use facesift_core::{DetectedFace, DetectorOptions, FaceDetector, FaceRecognizer, RecognizerOptions};
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{mpsc, oneshot};

/// Everything needed to bring the oracle up.
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub assets: ModelAssets,
    pub detector: DetectorOptions,
    pub recognizer: RecognizerOptions,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    DetectAll {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, OracleError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// False once the engine thread has exited.
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn detect_all(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, OracleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::DetectAll {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| OracleError::ChannelClosed)?;
        reply_rx.await.map_err(|_| OracleError::ChannelClosed)?
    }
}

/// SCRFD + ArcFace oracle. The host owns exactly one of these; models are
/// loaded on first `initialize()` and kept until the oracle is dropped or
/// the engine thread exits.
pub struct OnnxOracle {
    settings: OracleSettings,
    engine: SharedLoad<EngineHandle>,
}

impl OnnxOracle {
    pub fn new(settings: OracleSettings) -> Self {
        Self {
            settings,
            engine: SharedLoad::new(EngineHandle::is_alive),
        }
    }
}

#[async_trait]
impl EmbeddingOracle for OnnxOracle {
    async fn initialize(&self) -> Result<(), OracleError> {
        self.engine
            .get_or_load(|| spawn_engine(self.settings.clone()))
            .await?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.engine.get().is_some()
    }

    fn embedding_dim(&self) -> usize {
        self.settings.recognizer.embedding_dim
    }

    async fn detect_all(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, OracleError> {
        let engine = self.engine.get().ok_or(OracleError::NotInitialized)?;
        engine.detect_all(image).await
    }
}

/// Resolve model assets, then load both models on a dedicated thread.
///
/// Resolves only once the models are loaded, so a failure never leaves a
/// half-initialized engine behind.
async fn spawn_engine(settings: OracleSettings) -> Result<EngineHandle, OracleError> {
    let paths = settings.assets.resolve().await?;

    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), OracleError>>();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facesift-oracle".into())
        .spawn(move || {
            let (mut detector, mut recognizer) = match load_models(&paths, &settings) {
                Ok(models) => {
                    let _ = ready_tx.send(Ok(()));
                    models
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            tracing::info!("oracle engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::DetectAll { image, reply } => {
                        let result = catch_panic(|| run_detect_all(&mut detector, &mut recognizer, image));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("oracle engine thread exiting");
        })
        .map_err(|e| OracleError::Init(format!("failed to spawn oracle thread: {e}")))?;

    ready_rx.await.map_err(|_| OracleError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

/// Run `f`, turning a panic into an error so the engine thread survives.
fn catch_panic<T>(f: impl FnOnce() -> Result<T, OracleError>) -> Result<T, OracleError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(error = %message, "oracle engine panicked; image skipped");
        Err(OracleError::Panicked(message))
    })
}

fn load_models(
    paths: &ModelPaths,
    settings: &OracleSettings,
) -> Result<(FaceDetector, FaceRecognizer), OracleError> {
    let detector = FaceDetector::load(&paths.detector, settings.detector)
        .map_err(|e| OracleError::Init(format!("SCRFD detector: {e}")))?;
    tracing::info!(path = %paths.detector.display(), "SCRFD detector loaded");

    let recognizer = FaceRecognizer::load(&paths.recognizer, settings.recognizer.clone())
        .map_err(|e| OracleError::Init(format!("ArcFace recognizer: {e}")))?;
    tracing::info!(path = %paths.recognizer.display(), "ArcFace recognizer loaded");

    Ok((detector, recognizer))
}

/// Decode one image, detect every face and embed each one independently.
///
/// A face whose embedding fails is kept with `embedding: None` so the photo
/// still counts as containing a face.
fn run_detect_all(
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    image: Vec<u8>,
) -> Result<Vec<DetectedFace>, OracleError> {
    let decoded = image::load_from_memory(&image)?.to_rgb8();
    drop(image);

    let boxes = detector.detect(&decoded)?;
    tracing::debug!(
        width = decoded.width(),
        height = decoded.height(),
        faces = boxes.len(),
        "detect_all"
    );

    let faces = boxes
        .into_iter()
        .enumerate()
        .map(|(i, bbox)| {
            let embedding = match recognizer.extract(&decoded, &bbox) {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::warn!(face = i, error = %err, "embedding failed; keeping face without embedding");
                    None
                }
            };
            DetectedFace { bbox, embedding }
        })
        .collect();

    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> OracleSettings {
        OracleSettings {
            assets: ModelAssets::local(dir),
            detector: DetectorOptions::default(),
            recognizer: RecognizerOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_initialize_missing_models_stays_unready() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = OnnxOracle::new(settings(tmp.path()));

        let err = oracle.initialize().await.unwrap_err();
        assert!(matches!(err, OracleError::Assets(_)), "{err}");
        assert!(!oracle.is_ready());

        // retryable, still failing the same way
        assert!(oracle.initialize().await.is_err());
        assert!(!oracle.is_ready());
    }

    #[tokio::test]
    async fn test_detect_before_initialize() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = OnnxOracle::new(settings(tmp.path()));
        let err = oracle.detect_all(vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, OracleError::NotInitialized));
    }

    #[test]
    fn test_panic_becomes_error() {
        let result: Result<(), OracleError> = catch_panic(|| panic!("ort blew up"));
        assert!(matches!(result, Err(OracleError::Panicked(m)) if m == "ort blew up"));

        let ok = catch_panic(|| Ok(7));
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_engine_handle_dead_after_thread_exit() {
        let (tx, rx) = mpsc::channel::<EngineRequest>(1);
        let handle = EngineHandle { tx };
        assert!(handle.is_alive());
        drop(rx);
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.detect_all(vec![0]).await,
            Err(OracleError::ChannelClosed)
        ));
    }

    #[test]
    fn test_embedding_dim_from_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = settings(tmp.path());
        s.recognizer.embedding_dim = 128;
        assert_eq!(OnnxOracle::new(s).embedding_dim(), 128);
    }
}
