//! In-memory store implementations, for tests and hosts that persist
//! elsewhere.

use crate::store::{BlobStore, PhotoFilter, PhotoRecord, PhotoUpdate, RecordStore, ReferenceStore, StoreError, Stores};
use async_trait::async_trait;
use facesift_core::FaceEmbedding;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    reads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.blobs.lock().await.insert(id.to_string(), bytes);
        Ok(format!("memory://{id}"))
    }

    async fn read(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.blobs.lock().await.keys().cloned().collect())
    }
}

/// Records kept in ingestion order.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<PhotoRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.records.lock().await.iter().find(|r| r.id == id).cloned())
    }

    async fn upsert(&self, id: &str, update: PhotoUpdate) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.apply(&update);
        Ok(())
    }

    async fn query(&self, filter: PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| filter.accepts(r))
            .cloned()
            .collect())
    }

    async fn count(&self, filter: PhotoFilter) -> Result<usize, StoreError> {
        Ok(self.records.lock().await.iter().filter(|r| filter.accepts(r)).count())
    }

    async fn create(&self, record: PhotoRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.push(record);
        Ok(())
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let n = records.len();
        records.clear();
        Ok(n)
    }
}

#[derive(Default)]
pub struct MemoryReferenceStore {
    current: Mutex<Option<FaceEmbedding>>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn get(&self) -> Result<Option<FaceEmbedding>, StoreError> {
        Ok(self.current.lock().await.clone())
    }

    async fn set(&self, embedding: FaceEmbedding) -> Result<(), StoreError> {
        *self.current.lock().await = Some(embedding);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.current.lock().await = None;
        Ok(())
    }
}

/// Concrete handles to a fresh set of in-memory stores.
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub blobs: Arc<MemoryBlobStore>,
    pub records: Arc<MemoryRecordStore>,
    pub reference: Arc<MemoryReferenceStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        Stores {
            blobs: self.blobs.clone(),
            records: self.records.clone(),
            reference: self.reference.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_keep_ingestion_order() {
        let store = MemoryRecordStore::new();
        for id in ["c", "a", "b"] {
            store.create(PhotoRecord::new(id, id, "f.jpg", 1, "image/jpeg")).await.unwrap();
        }
        let ids: Vec<String> = store.query(PhotoFilter::all()).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let store = MemoryRecordStore::new();
        store.create(PhotoRecord::new("a", "a", "f.jpg", 1, "image/jpeg")).await.unwrap();
        let err = store.create(PhotoRecord::new("a", "a", "f.jpg", 1, "image/jpeg")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_upsert_unknown_id() {
        let store = MemoryRecordStore::new();
        let err = store.upsert("ghost", PhotoUpdate::processed_only()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let store = MemoryRecordStore::new();
        for id in ["a", "b", "c"] {
            store.create(PhotoRecord::new(id, id, "f.jpg", 1, "image/jpeg")).await.unwrap();
        }
        store.upsert("b", PhotoUpdate::outcome(true, true, Some(0.9))).await.unwrap();
        assert_eq!(store.count(PhotoFilter::unprocessed()).await.unwrap(), 2);
        assert_eq!(store.count(PhotoFilter::matches()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_reads_counter() {
        let blobs = MemoryBlobStore::new();
        let loc = blobs.write("x", vec![1, 2]).await.unwrap();
        assert_eq!(loc, "memory://x");
        assert_eq!(blobs.read("x").await.unwrap(), vec![1, 2]);
        assert!(blobs.read("y").await.is_err());
        assert_eq!(blobs.reads(), 2);
        blobs.delete("x").await.unwrap();
        assert!(blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_set_clear() {
        let store = MemoryReferenceStore::new();
        assert!(store.get().await.unwrap().is_none());
        store.set(FaceEmbedding::new(vec![1.0])).await.unwrap();
        assert_eq!(store.get().await.unwrap().map(|e| e.dim()), Some(1));
        store.clear().await.unwrap();
        assert!(store.get().await.unwrap().is_none());
    }
}
