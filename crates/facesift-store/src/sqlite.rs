//! SQLite-backed result ledger and reference store.
//!
//! All statements run on tokio-rusqlite's connection thread. Photos keep an
//! autoincrement `seq` so queries return them in ingestion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facesift_core::FaceEmbedding;
use facesift_pipeline::{PhotoFilter, PhotoRecord, PhotoUpdate, RecordStore, ReferenceStore, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    location        TEXT NOT NULL,
    filename        TEXT NOT NULL,
    size            INTEGER NOT NULL,
    mime_type       TEXT NOT NULL,
    has_face        INTEGER NOT NULL DEFAULT 0,
    is_match        INTEGER NOT NULL DEFAULT 0,
    face_confidence REAL,
    processed       INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_photos_processed ON photos(processed);

CREATE TABLE IF NOT EXISTS reference_face (
    slot          INTEGER PRIMARY KEY CHECK (slot = 0),
    embedding     BLOB NOT NULL,
    model_version TEXT,
    captured_at   TEXT NOT NULL
);
"#;

const PHOTO_COLUMNS: &str =
    "id, location, filename, size, mime_type, has_face, is_match, face_confidence, processed, created_at";

const FILTER_CLAUSE: &str = "(?1 IS NULL OR processed = ?1) AND (?2 IS NULL OR has_face = ?2) AND (?3 IS NULL OR is_match = ?3)";

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_constraint_violation(e: &tokio_rusqlite::Error) -> bool {
    matches!(
        e,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PhotoRecord> {
    Ok(PhotoRecord {
        id: row.get(0)?,
        location: row.get(1)?,
        filename: row.get(2)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        mime_type: row.get(4)?,
        has_face: row.get(5)?,
        is_match: row.get(6)?,
        face_confidence: row.get::<_, Option<f64>>(7)?.map(|c| c as f32),
        processed: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await.map_err(backend)?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "opened photo ledger");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await.map_err(backend)?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<PhotoRecord>, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?1");
                Ok(conn.query_row(&sql, [&id], row_to_record).optional()?)
            })
            .await
            .map_err(backend)
    }

    async fn upsert(&self, id: &str, update: PhotoUpdate) -> Result<(), StoreError> {
        let key = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let confidence_set = update.face_confidence.is_some();
                let confidence = update.face_confidence.flatten().map(f64::from);
                let n = conn.execute(
                    "UPDATE photos SET
                        has_face = COALESCE(?2, has_face),
                        is_match = COALESCE(?3, is_match),
                        face_confidence = CASE WHEN ?4 THEN ?5 ELSE face_confidence END,
                        processed = COALESCE(?6, processed)
                     WHERE id = ?1",
                    params![key, update.has_face, update.is_match, confidence_set, confidence, update.processed],
                )?;
                Ok(n)
            })
            .await
            .map_err(backend)?;

        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn query(&self, filter: PhotoFilter) -> Result<Vec<PhotoRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE {FILTER_CLAUSE} ORDER BY seq");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![filter.processed, filter.has_face, filter.is_match],
                    row_to_record,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(backend)
    }

    async fn count(&self, filter: PhotoFilter) -> Result<usize, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT COUNT(*) FROM photos WHERE {FILTER_CLAUSE}");
                let n: i64 = conn.query_row(
                    &sql,
                    params![filter.processed, filter.has_face, filter.is_match],
                    |row| row.get(0),
                )?;
                Ok(n.max(0) as usize)
            })
            .await
            .map_err(backend)
    }

    async fn create(&self, record: PhotoRecord) -> Result<(), StoreError> {
        let id = record.id.clone();
        let result = self
            .conn
            .call(move |conn| {
                let sql = format!("INSERT INTO photos ({PHOTO_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)");
                conn.execute(
                    &sql,
                    params![
                        record.id,
                        record.location,
                        record.filename,
                        i64::try_from(record.size).unwrap_or(i64::MAX),
                        record.mime_type,
                        record.has_face,
                        record.is_match,
                        record.face_confidence.map(f64::from),
                        record.processed,
                        record.created_at,
                    ],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists(id)),
            Err(e) => Err(backend(e)),
        }
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| Ok(conn.execute("DELETE FROM photos", [])?))
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl ReferenceStore for SqliteStore {
    async fn get(&self) -> Result<Option<FaceEmbedding>, StoreError> {
        self.conn
            .call(|conn| {
                let row = conn
                    .query_row(
                        "SELECT embedding, model_version, captured_at FROM reference_face WHERE slot = 0",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, Vec<u8>>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, DateTime<Utc>>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row.map(|(bytes, model_version, captured_at)| FaceEmbedding {
                    values: bytes_to_embedding(&bytes),
                    captured_at,
                    model_version,
                }))
            })
            .await
            .map_err(backend)
    }

    async fn set(&self, embedding: FaceEmbedding) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO reference_face (slot, embedding, model_version, captured_at)
                     VALUES (0, ?1, ?2, ?3)
                     ON CONFLICT(slot) DO UPDATE SET
                        embedding = excluded.embedding,
                        model_version = excluded.model_version,
                        captured_at = excluded.captured_at",
                    params![
                        embedding_to_bytes(&embedding.values),
                        embedding.model_version,
                        embedding.captured_at
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM reference_face", [])?;
                Ok(())
            })
            .await
            .map_err(backend)
    }
}
