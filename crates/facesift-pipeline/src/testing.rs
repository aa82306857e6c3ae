//! Scripted oracle for exercising the pipeline without model weights.
//!
//! Responses are keyed by the exact image bytes. Bytes that were never
//! scripted go through the real image decoder and fail as a decode error.

use crate::oracle::{EmbeddingOracle, OracleError, SharedLoad};
use async_trait::async_trait;
use facesift_core::{BoundingBox, DetectedFace, FaceEmbedding};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One face the scripted oracle will report.
#[derive(Debug, Clone)]
pub struct ScriptedFace {
    embedding: Option<Vec<f32>>,
    confidence: f32,
}

impl ScriptedFace {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            embedding: Some(values),
            confidence: 0.9,
        }
    }

    /// A detected face whose embedding could not be computed.
    pub fn without_embedding() -> Self {
        Self {
            embedding: None,
            confidence: 0.9,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    fn to_face(&self, index: usize) -> DetectedFace {
        let offset = index as f32 * 20.0;
        DetectedFace {
            bbox: BoundingBox {
                x: offset,
                y: offset,
                width: 16.0,
                height: 16.0,
                confidence: self.confidence,
                landmarks: None,
            },
            embedding: self.embedding.clone().map(FaceEmbedding::new),
        }
    }
}

#[derive(Debug, Clone)]
enum Script {
    Faces(Vec<ScriptedFace>),
    Fail(String),
}

pub struct ScriptedOracle {
    dim: usize,
    scripts: Mutex<HashMap<Vec<u8>, Script>>,
    fail_init: AtomicBool,
    models: SharedLoad<()>,
    init_calls: AtomicUsize,
    loads: AtomicUsize,
    detect_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            scripts: Mutex::new(HashMap::new()),
            fail_init: AtomicBool::new(false),
            models: SharedLoad::new(|_| true),
            init_calls: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            detect_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_faces(&self, image: &[u8], faces: Vec<ScriptedFace>) {
        self.insert(image, Script::Faces(faces));
    }

    /// Make `detect_all` fail for `image` with an oracle-level error.
    pub fn script_failure(&self, image: &[u8], message: impl Into<String>) {
        self.insert(image, Script::Fail(message.into()));
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of model loads that ran, as opposed to `initialize` calls.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    fn insert(&self, image: &[u8], script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(image.to_vec(), script);
        }
    }
}

#[async_trait]
impl EmbeddingOracle for ScriptedOracle {
    async fn initialize(&self) -> Result<(), OracleError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.models
            .get_or_load(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                if self.fail_init.load(Ordering::SeqCst) {
                    return Err(OracleError::Init("scripted initialization failure".into()));
                }
                Ok(())
            })
            .await
    }

    fn is_ready(&self) -> bool {
        self.models.get().is_some()
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    async fn detect_all(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, OracleError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_ready() {
            return Err(OracleError::NotInitialized);
        }

        let script = self
            .scripts
            .lock()
            .map_err(|_| OracleError::Init("script table poisoned".into()))?
            .get(&image)
            .cloned();

        match script {
            Some(Script::Faces(faces)) => Ok(faces.iter().enumerate().map(|(i, f)| f.to_face(i)).collect()),
            Some(Script::Fail(message)) => Err(OracleError::Init(message)),
            None => match image::load_from_memory(&image) {
                Err(e) => Err(OracleError::Decode(e)),
                Ok(_) => Ok(Vec::new()),
            },
        }
    }
}
