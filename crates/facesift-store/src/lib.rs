//! facesift-store — Persistent stores for the facesift pipeline.
//!
//! Photo bytes live as plain files under a blob directory; the result
//! ledger and the reference embedding live in one SQLite database.

pub mod blobs;
pub mod sqlite;

pub use blobs::FsBlobStore;
pub use sqlite::SqliteStore;

use facesift_pipeline::Stores;
use std::path::Path;
use std::sync::Arc;

/// Open the on-disk stores rooted at `db_path` and `blob_dir`.
pub async fn open(db_path: &Path, blob_dir: &Path) -> Result<Stores, facesift_pipeline::StoreError> {
    let sqlite = Arc::new(SqliteStore::open(db_path).await?);
    let blobs = Arc::new(FsBlobStore::new(blob_dir));
    Ok(Stores {
        blobs,
        records: sqlite.clone(),
        reference: sqlite,
    })
}
