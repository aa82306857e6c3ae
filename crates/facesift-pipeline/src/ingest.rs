//! Adding photos to the library.

use crate::store::{PhotoRecord, StoreError, Stores};
use image::ImageFormat;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0}: empty file")]
    Empty(String),
    #[error("{0}: not a recognized image format")]
    UnsupportedFormat(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// MIME type from the content, falling back to the file extension.
pub fn sniff_mime(filename: &str, bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .or_else(|| ImageFormat::from_path(Path::new(filename)).ok())
        .map(|f| f.to_mime_type())
}

/// Store `bytes` as a new unprocessed photo and return its record.
pub async fn ingest(stores: &Stores, filename: &str, bytes: Vec<u8>) -> Result<PhotoRecord, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Empty(filename.to_string()));
    }
    let mime = sniff_mime(filename, &bytes).ok_or_else(|| IngestError::UnsupportedFormat(filename.to_string()))?;

    let id = Uuid::new_v4().to_string();
    let size = bytes.len() as u64;
    let location = stores.blobs.write(&id, bytes).await?;

    let record = PhotoRecord::new(&id, location, filename, size, mime);
    if let Err(e) = stores.records.create(record.clone()).await {
        if let Err(cleanup) = stores.blobs.delete(&id).await {
            tracing::warn!(id, error = %cleanup, "failed to remove orphaned blob");
        }
        return Err(e.into());
    }

    tracing::debug!(id, filename, size, mime, "photo ingested");
    Ok(record)
}
