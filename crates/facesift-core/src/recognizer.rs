//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from padded face crops,
//! using the w600k_r50 ArcFace model.

use crate::crop::{self, FACE_PADDING_RATIO};
use crate::tensor::{ChannelLayout, InputSpec, Normalization, TensorError};
use crate::types::{BoundingBox, FaceEmbedding};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// ArcFace input contract: 112×112 RGB, symmetric `(p - 127.5) / 127.5`.
pub const ARCFACE_INPUT: InputSpec = InputSpec {
    width: 112,
    height: 112,
    layout: ChannelLayout::RgbPlanar,
    normalization: Normalization { mean: 127.5, std: 127.5 },
};

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download w600k_r50.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} does not overlap the image")]
    EmptyCrop(BoundingBox),
    #[error("tensor: {0}")]
    Tensor(#[from] TensorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tunables for [`FaceRecognizer::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerOptions {
    /// Expected output length; anything else is an inference failure.
    pub embedding_dim: usize,
    /// L2-normalize outputs (required by the cosine metric).
    pub normalize: bool,
    pub intra_threads: usize,
    pub model_version: String,
}

impl Default for RecognizerOptions {
    fn default() -> Self {
        Self {
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            normalize: true,
            intra_threads: 2,
            model_version: ARCFACE_MODEL_VERSION.to_string(),
        }
    }
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
    options: RecognizerOptions,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, options: RecognizerOptions) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(options.intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            dim = options.embedding_dim,
            "loaded ArcFace model"
        );

        Ok(Self { session, options })
    }

    pub fn embedding_dim(&self) -> usize {
        self.options.embedding_dim
    }

    /// Extract an embedding for one detected face.
    ///
    /// The face box is padded, cropped and resized to 112×112 before inference.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceEmbedding, RecognizerError> {
        let crop = crop::crop_face(image, face, FACE_PADDING_RATIO, &ARCFACE_INPUT)
            .ok_or_else(|| RecognizerError::EmptyCrop(face.clone()))?;
        let input = ARCFACE_INPUT.to_tensor(&crop)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let embedding = finish_embedding(raw_data.to_vec(), &self.options)?;
        Ok(embedding)
    }
}

/// Validate the raw model output and normalize it if configured.
///
/// This is the only place embeddings are normalized.
fn finish_embedding(raw: Vec<f32>, options: &RecognizerOptions) -> Result<FaceEmbedding, RecognizerError> {
    if raw.len() != options.embedding_dim {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {}-dim embedding, got {}",
            options.embedding_dim,
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed("embedding contains non-finite values".into()));
    }

    let embedding = FaceEmbedding::new(raw).with_model_version(options.model_version.clone());
    Ok(if options.normalize {
        embedding.l2_normalized()
    } else {
        embedding
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dim: usize, normalize: bool) -> RecognizerOptions {
        RecognizerOptions {
            embedding_dim: dim,
            normalize,
            ..RecognizerOptions::default()
        }
    }

    #[test]
    fn test_finish_embedding_normalizes() {
        let e = finish_embedding(vec![3.0, 0.0, 4.0], &options(3, true)).unwrap();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert_eq!(e.model_version.as_deref(), Some(ARCFACE_MODEL_VERSION));
    }

    #[test]
    fn test_finish_embedding_raw_when_not_normalizing() {
        let e = finish_embedding(vec![3.0, 0.0, 4.0], &options(3, false)).unwrap();
        assert_eq!(e.values, vec![3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_finish_embedding_wrong_dim() {
        let err = finish_embedding(vec![0.1; 128], &options(512, true)).unwrap_err();
        assert!(err.to_string().contains("expected 512-dim"), "{err}");
    }

    #[test]
    fn test_finish_embedding_rejects_nan() {
        let err = finish_embedding(vec![0.1, f32::NAN], &options(2, true)).unwrap_err();
        assert!(matches!(err, RecognizerError::InferenceFailed(_)));
    }

    #[test]
    fn test_arcface_input_contract() {
        assert_eq!((ARCFACE_INPUT.width, ARCFACE_INPUT.height), (112, 112));
        // 127.5 maps to 0 under symmetric normalization
        let n = ARCFACE_INPUT.normalization;
        assert!((n.apply(255) - 1.0).abs() < 1e-6);
        assert!((n.apply(0) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx"), RecognizerOptions::default());
        assert!(matches!(err, Err(RecognizerError::ModelNotFound(_))));
    }
}
