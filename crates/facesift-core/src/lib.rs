//! facesift-core — Face detection, recognition and similarity scoring.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition,
//! both running via ONNX Runtime. The scorer is a pure policy layer
//! over whatever embeddings the models produce.

pub mod crop;
pub mod detector;
pub mod recognizer;
pub mod scorer;
pub mod tensor;
pub mod types;

pub use detector::{DetectorOptions, FaceDetector};
pub use recognizer::{FaceRecognizer, RecognizerOptions};
pub use scorer::{ComparisonResult, Metric, ScoreError, Scorer, ScorerConfig};
pub use tensor::{ChannelLayout, InputSpec, Normalization};
pub use types::{BoundingBox, DetectedFace, FaceEmbedding};
