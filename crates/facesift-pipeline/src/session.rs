//! Reference calibration and user-triggered reset.

use crate::oracle::{EmbeddingOracle, OracleError};
use crate::store::{StoreError, Stores};
use facesift_core::FaceEmbedding;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("no face found in the calibration image")]
    NoFace,
    #[error("faces were found but none could be embedded")]
    NoEmbedding,
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// What a reset removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub records: usize,
    pub blobs: usize,
}

/// Host-facing operations around the reference face.
pub struct Session {
    oracle: Arc<dyn EmbeddingOracle>,
    stores: Stores,
}

impl Session {
    pub fn new(oracle: Arc<dyn EmbeddingOracle>, stores: Stores) -> Self {
        Self { oracle, stores }
    }

    /// Embed the most confidently detected face in `image` and store it as
    /// the reference, replacing any previous one.
    pub async fn calibrate(&self, image: Vec<u8>) -> Result<FaceEmbedding, CalibrationError> {
        self.oracle.initialize().await?;
        let faces = self.oracle.detect_all(image).await?;
        if faces.is_empty() {
            return Err(CalibrationError::NoFace);
        }

        let mut chosen: Option<(f32, FaceEmbedding)> = None;
        for face in faces {
            let confidence = face.confidence();
            let Some(embedding) = face.embedding else { continue };
            if chosen.as_ref().map_or(true, |(best, _)| confidence > *best) {
                chosen = Some((confidence, embedding));
            }
        }
        let (confidence, embedding) = chosen.ok_or(CalibrationError::NoEmbedding)?;

        self.stores.reference.set(embedding.clone()).await?;
        tracing::info!(confidence, dim = embedding.dim(), "reference face calibrated");
        Ok(embedding)
    }

    pub async fn reference(&self) -> Result<Option<FaceEmbedding>, StoreError> {
        self.stores.reference.get().await
    }

    pub async fn clear_reference(&self) -> Result<(), StoreError> {
        self.stores.reference.clear().await?;
        tracing::info!("reference face cleared");
        Ok(())
    }

    /// Drop the reference, every record and every blob.
    pub async fn reset(&self) -> Result<ResetSummary, StoreError> {
        self.stores.reference.clear().await?;
        let records = self.stores.records.delete_all().await?;

        let mut blobs = 0;
        for id in self.stores.blobs.list().await? {
            match self.stores.blobs.delete(&id).await {
                Ok(()) => blobs += 1,
                // already gone
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(records, blobs, "library reset");
        Ok(ResetSummary { records, blobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStores;
    use crate::store::{BlobStore, PhotoRecord, RecordStore, ReferenceStore};
    use crate::testing::{ScriptedFace, ScriptedOracle};

    #[tokio::test]
    async fn test_calibrate_picks_most_confident_face() {
        let oracle = Arc::new(ScriptedOracle::new(2));
        oracle.script_faces(
            b"selfie",
            vec![
                ScriptedFace::new(vec![1.0, 0.0]).with_confidence(0.6),
                ScriptedFace::new(vec![0.0, 1.0]).with_confidence(0.95),
                ScriptedFace::without_embedding().with_confidence(0.99),
            ],
        );
        let mem = MemoryStores::new();
        let session = Session::new(oracle.clone(), mem.stores());

        let reference = session.calibrate(b"selfie".to_vec()).await.unwrap();
        assert_eq!(reference.values, vec![0.0, 1.0]);
        assert_eq!(mem.reference.get().await.unwrap(), Some(reference));
        assert_eq!(oracle.init_calls(), 1);
    }

    #[tokio::test]
    async fn test_calibrate_without_face() {
        let oracle = Arc::new(ScriptedOracle::new(2));
        oracle.script_faces(b"wall", vec![]);
        let session = Session::new(oracle, MemoryStores::new().stores());
        assert!(matches!(
            session.calibrate(b"wall".to_vec()).await,
            Err(CalibrationError::NoFace)
        ));
    }

    #[tokio::test]
    async fn test_calibrate_faces_without_embeddings() {
        let oracle = Arc::new(ScriptedOracle::new(2));
        oracle.script_faces(b"blurry", vec![ScriptedFace::without_embedding()]);
        let mem = MemoryStores::new();
        let session = Session::new(oracle, mem.stores());
        assert!(matches!(
            session.calibrate(b"blurry".to_vec()).await,
            Err(CalibrationError::NoEmbedding)
        ));
        assert!(mem.reference.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let mem = MemoryStores::new();
        mem.reference.set(FaceEmbedding::new(vec![1.0])).await.unwrap();
        for id in ["a", "b"] {
            mem.blobs.write(id, vec![0]).await.unwrap();
            mem.records
                .create(PhotoRecord::new(id, id, "x.jpg", 1, "image/jpeg"))
                .await
                .unwrap();
        }

        let session = Session::new(Arc::new(ScriptedOracle::new(1)), mem.stores());
        let summary = session.reset().await.unwrap();

        assert_eq!(summary, ResetSummary { records: 2, blobs: 2 });
        assert!(session.reference().await.unwrap().is_none());
        assert!(mem.blobs.list().await.unwrap().is_empty());
        assert_eq!(mem.records.count(crate::store::PhotoFilter::all()).await.unwrap(), 0);
    }
}
