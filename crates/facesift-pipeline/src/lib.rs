//! facesift-pipeline — Batch face matching over a local photo library.
//!
//! Reads the calibrated reference embedding once per run, asks the
//! embedding oracle for every face in each candidate photo, keeps the
//! closest face per photo and writes the outcome to the record store.

pub mod assets;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod memory;
pub mod oracle;
pub mod pipeline;
pub mod progress;
pub mod schedule;
pub mod session;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use engine::{OnnxOracle, OracleSettings};
pub use oracle::{EmbeddingOracle, OracleError};
pub use pipeline::{BatchPipeline, PipelineError};
pub use progress::ProgressSink;
pub use schedule::{CancelFlag, Yielder};
pub use session::Session;
pub use state::{RunState, RunStatus};
pub use store::{BlobStore, PhotoFilter, PhotoRecord, PhotoUpdate, RecordStore, ReferenceStore, StoreError, Stores};
