//! Storage contracts the pipeline runs against.
//!
//! - [`BlobStore`]: raw photo bytes keyed by id.
//! - [`RecordStore`]: the result ledger, one [`PhotoRecord`] per photo.
//! - [`ReferenceStore`]: the single calibrated reference embedding.
//!
//! The pipeline only ever reads blobs, reads the reference and applies
//! partial [`PhotoUpdate`]s. Creation and deletion belong to ingestion and
//! reset.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facesift_core::FaceEmbedding;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid id: {0:?}")]
    InvalidId(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// One candidate photo and its match outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    /// Opaque blob location returned by [`BlobStore::write`].
    pub location: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub has_face: bool,
    pub is_match: bool,
    pub face_confidence: Option<f32>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl PhotoRecord {
    /// A freshly ingested, unprocessed record.
    pub fn new(
        id: impl Into<String>,
        location: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            filename: filename.into(),
            size,
            mime_type: mime_type.into(),
            has_face: false,
            is_match: false,
            face_confidence: None,
            processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, update: &PhotoUpdate) {
        if let Some(v) = update.has_face {
            self.has_face = v;
        }
        if let Some(v) = update.is_match {
            self.is_match = v;
        }
        if let Some(v) = update.face_confidence {
            self.face_confidence = v;
        }
        if let Some(v) = update.processed {
            self.processed = v;
        }
    }
}

/// Partial update of the ledger fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoUpdate {
    pub has_face: Option<bool>,
    pub is_match: Option<bool>,
    /// `Some(None)` clears the stored confidence.
    pub face_confidence: Option<Option<f32>>,
    pub processed: Option<bool>,
}

impl PhotoUpdate {
    /// Final state of a photo in which no face was found.
    pub fn no_face() -> Self {
        Self::outcome(false, false, None)
    }

    pub fn outcome(has_face: bool, is_match: bool, confidence: Option<f32>) -> Self {
        Self {
            has_face: Some(has_face),
            is_match: Some(is_match),
            face_confidence: Some(confidence),
            processed: Some(true),
        }
    }

    /// Mark processed without touching the match fields.
    pub fn processed_only() -> Self {
        Self {
            processed: Some(true),
            ..Self::default()
        }
    }
}

/// Equality constraints for [`RecordStore::query`] / [`RecordStore::count`].
///
/// Results are returned in ingestion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhotoFilter {
    pub processed: Option<bool>,
    pub has_face: Option<bool>,
    pub is_match: Option<bool>,
}

impl PhotoFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unprocessed() -> Self {
        Self {
            processed: Some(false),
            ..Self::default()
        }
    }

    pub fn matches() -> Self {
        Self {
            is_match: Some(true),
            ..Self::default()
        }
    }

    pub fn accepts(&self, record: &PhotoRecord) -> bool {
        self.processed.map_or(true, |v| record.processed == v)
            && self.has_face.map_or(true, |v| record.has_face == v)
            && self.is_match.map_or(true, |v| record.is_match == v)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `id`, returning an opaque location.
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<String, StoreError>;
    async fn read(&self, id: &str) -> Result<Vec<u8>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>, StoreError>;
    /// Apply a partial update. Fails with [`StoreError::NotFound`] for unknown ids.
    async fn upsert(&self, id: &str, update: PhotoUpdate) -> Result<(), StoreError>;
    async fn query(&self, filter: PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError>;
    async fn count(&self, filter: PhotoFilter) -> Result<usize, StoreError>;
    /// Ingestion only.
    async fn create(&self, record: PhotoRecord) -> Result<(), StoreError>;
    /// Reset only. Returns the number of records removed.
    async fn delete_all(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn get(&self) -> Result<Option<FaceEmbedding>, StoreError>;
    async fn set(&self, embedding: FaceEmbedding) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// The three stores a host wires together.
#[derive(Clone)]
pub struct Stores {
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    pub reference: Arc<dyn ReferenceStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_initial_state() {
        let r = PhotoRecord::new("p1", "blobs/p1", "a.jpg", 10, "image/jpeg");
        assert!(!r.has_face && !r.is_match && !r.processed);
        assert_eq!(r.face_confidence, None);
    }

    #[test]
    fn test_apply_partial_update() {
        let mut r = PhotoRecord::new("p1", "blobs/p1", "a.jpg", 10, "image/jpeg");
        r.apply(&PhotoUpdate::outcome(true, true, Some(0.8)));
        assert!(r.has_face && r.is_match && r.processed);
        assert_eq!(r.face_confidence, Some(0.8));

        // processed_only keeps prior match fields
        r.apply(&PhotoUpdate::processed_only());
        assert!(r.is_match);
        assert_eq!(r.face_confidence, Some(0.8));

        r.apply(&PhotoUpdate::no_face());
        assert!(!r.has_face && !r.is_match);
        assert_eq!(r.face_confidence, None);
    }

    #[test]
    fn test_filter_accepts() {
        let mut r = PhotoRecord::new("p1", "l", "a.jpg", 1, "image/png");
        assert!(PhotoFilter::unprocessed().accepts(&r));
        assert!(!PhotoFilter::matches().accepts(&r));
        r.apply(&PhotoUpdate::outcome(true, true, Some(0.5)));
        assert!(!PhotoFilter::unprocessed().accepts(&r));
        assert!(PhotoFilter::matches().accepts(&r));
        assert!(PhotoFilter::all().accepts(&r));
    }
}
