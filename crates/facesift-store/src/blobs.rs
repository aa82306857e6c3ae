//! Filesystem blob store: one file per photo, named by its id.

use async_trait::async_trait;
use facesift_pipeline::{BlobStore, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const PARTIAL_SUFFIX: &str = ".part";

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let invalid = id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0'])
            || id.ends_with(PARTIAL_SUFFIX);
        if invalid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

fn not_found(id: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound(id.to_string())
    } else {
        StoreError::Io(e)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Write then rename so readers never see a half-written photo.
        let partial = self.root.join(format!("{id}{PARTIAL_SUFFIX}"));
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        tracing::trace!(id, size = bytes.len(), "blob written");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn read(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(id)?;
        tokio::fs::read(&path).await.map_err(|e| not_found(id, e))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        tokio::fs::remove_file(&path).await.map_err(|e| not_found(id, e))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.ends_with(PARTIAL_SUFFIX) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
